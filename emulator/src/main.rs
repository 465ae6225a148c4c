mod sim;

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use crossterm::style::Stylize;

use sim::{LineKind, Scenario, ScenarioSettings, Simulator, TranscriptLine, TranscriptWriter};

const USAGE: &str = "Usage: node-emulator [--scenario <name>] [--cycles <n>] \
[--sensor-failures <n>] [--connect-delay-ms <ms>] [--no-broker] [--log <path>]";

struct Options {
    scenario: Scenario,
    settings: ScenarioSettings,
    log: Option<PathBuf>,
}

fn main() -> io::Result<()> {
    let options = parse_options(env::args().skip(1)).unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        eprintln!(
            "Scenarios: {}",
            Scenario::ALL.map(Scenario::tag).join(", ")
        );
        process::exit(2);
    });

    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut log = match &options.log {
        Some(path) => Some(TranscriptWriter::create(path, options.scenario.header())?),
        None => None,
    };

    writeln!(writer, "{}", options.scenario.header().bold())?;
    let mut simulator = Simulator::new(options.settings);
    let mut published = 0;
    for _ in 0..simulator.settings().cycles {
        let result = simulator.run_cycle();
        let lines = simulator.take_transcript();
        for line in &lines {
            print_line(&mut writer, line)?;
        }
        if let Some(log) = log.as_mut() {
            log.append(&lines)?;
        }
        match result {
            Ok(outcome) => published += outcome.published.len(),
            Err(err) => {
                writeln!(writer, "{}", format!("error: {err}").red().bold())?;
                process::exit(1);
            }
        }
    }

    writeln!(
        writer,
        "{} cycles, {published} publishes, virtual clock at {} ms",
        simulator.settings().cycles,
        simulator.now().as_millis()
    )?;
    Ok(())
}

fn print_line(writer: &mut impl Write, line: &TranscriptLine) -> io::Result<()> {
    let rendered = line.to_string();
    match line.kind {
        LineKind::NodeToLink => writeln!(writer, "{}", rendered.green()),
        LineKind::LinkToNode => writeln!(writer, "{}", rendered.yellow()),
        LineKind::Status => writeln!(writer, "{}", rendered.magenta()),
        LineKind::Telemetry => writeln!(writer, "{}", rendered.dark_grey()),
        LineKind::Summary => writeln!(writer, "{}", rendered.cyan().bold()),
    }
}

fn parse_options(mut args: impl Iterator<Item = String>) -> Result<Options, String> {
    let mut scenario = Scenario::Nominal;
    let mut cycles = None;
    let mut sensor_failures = None;
    let mut connect_delay = None;
    let mut no_broker = false;
    let mut log = None;

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => {
                (flag.to_string(), Some(value.to_string()))
            }
            _ => (arg.clone(), None),
        };
        let mut value = |name: &str| {
            inline
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| format!("Expected value after {name}"))
        };

        match flag.as_str() {
            "--scenario" => scenario = Scenario::from_tag(&value("--scenario")?)?,
            "--cycles" => cycles = Some(parse_number(&value("--cycles")?, "--cycles")?),
            "--sensor-failures" => {
                let failures = parse_number(&value("--sensor-failures")?, "--sensor-failures")?;
                sensor_failures = Some(failures);
            }
            "--connect-delay-ms" => {
                let millis = parse_number(&value("--connect-delay-ms")?, "--connect-delay-ms")?;
                connect_delay = Some(Duration::from_millis(u64::from(millis)));
            }
            "--no-broker" => no_broker = true,
            "--log" => log = Some(PathBuf::from(value("--log")?)),
            "--help" | "-h" => return Err("Wake-cycle emulator".to_string()),
            other if !other.starts_with('-') => scenario = Scenario::from_tag(other)?,
            other => return Err(format!("Unknown option `{other}`")),
        }
    }

    let mut settings = scenario.settings();
    if let Some(cycles) = cycles {
        settings.cycles = cycles;
    }
    if let Some(failures) = sensor_failures {
        settings.sensor_failures = failures;
    }
    if let Some(delay) = connect_delay {
        settings.broker.connect_delay = Some(delay);
    }
    if no_broker {
        settings.broker.connect_delay = None;
    }

    Ok(Options {
        scenario,
        settings,
        log,
    })
}

fn parse_number(text: &str, flag: &str) -> Result<u32, String> {
    text.parse()
        .map_err(|_| format!("{flag} expects a non-negative integer, got `{text}`"))
}
