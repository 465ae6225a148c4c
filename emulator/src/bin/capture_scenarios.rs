use std::io;
use std::path::Path;

#[allow(dead_code)]
#[path = "../sim.rs"]
mod sim;

use sim::{Scenario, Simulator, TranscriptWriter};

fn main() -> io::Result<()> {
    for scenario in Scenario::ALL {
        record_scenario(scenario)?;
    }
    Ok(())
}

fn record_scenario(scenario: Scenario) -> io::Result<()> {
    let mut writer = TranscriptWriter::create(Path::new(scenario.log_path()), scenario.header())?;
    let mut simulator = Simulator::new(scenario.settings());

    for _ in 0..simulator.settings().cycles {
        let result = simulator.run_cycle();
        writer.append(&simulator.take_transcript())?;
        if let Err(err) = result {
            return Err(io::Error::other(format!("{}: {err}", scenario.tag())));
        }
    }

    println!("{} -> {}", scenario.tag(), scenario.log_path());
    Ok(())
}
