#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! BME280 acquisition source.
//!
//! The chip is configured lazily on the first attempt so a sensor that is
//! still powering up is retried like any other transient failure. Each
//! attempt takes one forced-mode measurement.

use bme280::i2c::BME280;
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use node_core::acquisition::{Reading, SensorDriver};

/// Failure of one attempt; the aggregator only needs `Debug`.
#[derive(Debug)]
pub enum Bme280Error<E> {
    Init(bme280::Error<E>),
    Measure(bme280::Error<E>),
}

pub struct Bme280Source<I2C, D> {
    sensor: BME280<I2C>,
    delay: D,
    initialized: bool,
}

impl<I2C, D> Bme280Source<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(i2c: I2C, delay: D) -> Self {
        Self {
            sensor: BME280::new_primary(i2c),
            delay,
            initialized: false,
        }
    }
}

impl<I2C, D> SensorDriver for Bme280Source<I2C, D>
where
    I2C: I2c,
    I2C::Error: core::fmt::Debug,
    D: DelayNs,
{
    type Error = Bme280Error<I2C::Error>;

    fn trigger(&mut self) -> Result<(), Self::Error> {
        if !self.initialized {
            self.sensor
                .init(&mut self.delay)
                .map_err(Bme280Error::Init)?;
            self.initialized = true;
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Reading, Self::Error> {
        let measurements = self
            .sensor
            .measure(&mut self.delay)
            .map_err(Bme280Error::Measure)?;
        Ok(reading_from(
            measurements.temperature,
            measurements.humidity,
            measurements.pressure,
        ))
    }
}

/// Builds the published reading; pressure arrives in pascals and is reported in hectopascals.
pub fn reading_from(temperature: f32, humidity: f32, pressure_pa: f32) -> Reading {
    Reading::new()
        .with("temperature", temperature)
        .with("humidity", humidity)
        .with("pressure", pressure_pa / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_is_reported_in_hectopascals() {
        let reading = reading_from(21.5, 48.25, 100_975.0);

        assert_eq!(reading.get("temperature"), Some(21.5));
        assert_eq!(reading.get("humidity"), Some(48.25));
        assert_eq!(reading.get("pressure"), Some(1009.75));
    }
}
