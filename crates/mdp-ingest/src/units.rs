//! Unit normalization
//!
//! Every measurement is converted to one canonical unit per physical
//! dimension. Unit symbols are matched case-insensitively; `K` is kelvin.

use mdp_common::types::{CanonicalUnit, Measurement};

/// Linear conversion `canonical = value * scale + offset`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Conversion {
    unit: CanonicalUnit,
    scale: f64,
    offset: f64,
}

const fn to(unit: CanonicalUnit, scale: f64, offset: f64) -> Conversion {
    Conversion {
        unit,
        scale,
        offset,
    }
}

fn conversion(symbol: &str) -> Option<Conversion> {
    use CanonicalUnit::*;
    let symbol = symbol.trim().to_lowercase();
    let c = match symbol.as_str() {
        // temperature
        "degc" | "°c" | "c" | "celsius" | "deg_c" => to(Celsius, 1.0, 0.0),
        "degf" | "°f" | "f" | "fahrenheit" | "deg_f" => to(Celsius, 5.0 / 9.0, -32.0 * 5.0 / 9.0),
        "k" | "kelvin" => to(Celsius, 1.0, -273.15),
        // length
        "m" | "meter" | "meters" | "metre" | "metres" => to(Meters, 1.0, 0.0),
        "cm" => to(Meters, 0.01, 0.0),
        "ft" | "feet" | "foot" => to(Meters, 0.3048, 0.0),
        // speed
        "m/s" | "mps" | "m s-1" => to(MetersPerSecond, 1.0, 0.0),
        "kn" | "kt" | "kts" | "knot" | "knots" => to(MetersPerSecond, 1852.0 / 3600.0, 0.0),
        "km/h" | "kph" => to(MetersPerSecond, 1.0 / 3.6, 0.0),
        // atmospheric pressure
        "hpa" | "mbar" | "mb" => to(Hectopascal, 1.0, 0.0),
        "kpa" => to(Hectopascal, 10.0, 0.0),
        "inhg" => to(Hectopascal, 33.8639, 0.0),
        // salinity
        "psu" | "pss" | "pss-78" => to(Psu, 1.0, 0.0),
        // sea pressure
        "dbar" | "decibar" => to(Decibar, 1.0, 0.0),
        // period
        "s" | "sec" | "secs" | "second" | "seconds" => to(Seconds, 1.0, 0.0),
        // direction
        "deg" | "degt" | "degrees" | "°" => to(Degrees, 1.0, 0.0),
        // visibility
        "nmi" | "nautical_miles" => to(NauticalMiles, 1.0, 0.0),
        "mi" => to(NauticalMiles, 1609.344 / 1852.0, 0.0),
        _ => return None,
    };
    Some(c)
}

/// Canonical unit expected for a known parameter
pub fn expected_unit(parameter: &str) -> Option<CanonicalUnit> {
    use CanonicalUnit::*;
    let unit = match parameter {
        "temperature" | "water_temperature" | "air_temperature" | "dew_point" => Celsius,
        "wave_height" | "tide_level" | "depth" => Meters,
        "wind_speed" | "wind_gust" | "current_speed" => MetersPerSecond,
        "air_pressure" => Hectopascal,
        "salinity" => Psu,
        "pressure" | "sea_pressure" => Decibar,
        "dominant_wave_period" | "average_wave_period" => Seconds,
        "wind_direction" | "wave_direction" => Degrees,
        "visibility" => NauticalMiles,
        _ => return None,
    };
    Some(unit)
}

/// Why a measurement could not be normalized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    #[error("unknown unit '{0}'")]
    UnknownUnit(String),
    /// Unit is known but measures a different dimension than the parameter
    #[error("unit '{unit}' does not fit parameter '{parameter}'")]
    Mismatch {
        parameter: String,
        unit: String,
    },
}

/// Convert `value` in `unit` to the canonical unit for `parameter`
pub fn normalize(parameter: &str, value: f64, unit: &str) -> Result<Measurement, UnitError> {
    let c = conversion(unit).ok_or_else(|| UnitError::UnknownUnit(unit.to_string()))?;
    if let Some(expected) = expected_unit(parameter) {
        if expected != c.unit {
            return Err(UnitError::Mismatch {
                parameter: parameter.to_string(),
                unit: unit.to_string(),
            });
        }
    }
    Ok(Measurement::new(value * c.scale + c.offset, c.unit))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_temperature_conversions() {
        let f = normalize("water_temperature", 212.0, "degF").unwrap();
        assert!(approx(f.value, 100.0));
        assert_eq!(f.unit, CanonicalUnit::Celsius);

        let k = normalize("water_temperature", 273.15, "K").unwrap();
        assert!(approx(k.value, 0.0));
    }

    #[test]
    fn test_speed_and_pressure_conversions() {
        assert!(approx(normalize("wind_speed", 10.0, "knots").unwrap().value, 5.144444));
        assert!(approx(normalize("wind_speed", 36.0, "km/h").unwrap().value, 10.0));
        assert!(approx(normalize("air_pressure", 101.3, "kPa").unwrap().value, 1013.0));
        assert!((normalize("air_pressure", 29.92, "inHg").unwrap().value - 1013.208).abs() < 1e-3);
    }

    #[test]
    fn test_feed_unit_spellings() {
        assert_eq!(
            normalize("dominant_wave_period", 8.0, "sec").unwrap().unit,
            CanonicalUnit::Seconds
        );
        assert_eq!(
            normalize("wind_direction", 270.0, "degT").unwrap().unit,
            CanonicalUnit::Degrees
        );
        assert!(approx(normalize("tide_level", 10.0, "ft").unwrap().value, 3.048));
    }

    #[test]
    fn test_unknown_and_mismatched_units() {
        assert_eq!(
            normalize("wave_height", 1.0, "furlongs"),
            Err(UnitError::UnknownUnit("furlongs".to_string()))
        );
        assert!(matches!(
            normalize("wave_height", 1.0, "degC"),
            Err(UnitError::Mismatch { .. })
        ));
        // Unknown parameters accept any known unit
        assert!(normalize("chlorophyll_depth", 3.0, "m").is_ok());
    }

    #[test]
    fn test_error_messages() {
        let err = normalize("wave_height", 1.0, "degC").unwrap_err();
        assert_eq!(err.to_string(), "unit 'degC' does not fit parameter 'wave_height'");
        let err: Box<dyn std::error::Error> = Box::new(UnitError::UnknownUnit("furlongs".to_string()));
        assert_eq!(err.to_string(), "unknown unit 'furlongs'");
    }
}
