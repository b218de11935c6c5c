use std::path::Path;

use time::{
    format_description::well_known::Rfc3339, macros::format_description, Date, Duration,
    OffsetDateTime, PrimitiveDateTime,
};

use crate::{Parameter, SwathError, SwathGrid};

/// GPS epoch, what TEMPO L2 `time` counts from when the file does not say
pub const GPS_EPOCH: OffsetDateTime = time::macros::datetime!(1980-01-06 00:00 UTC);

pub const DEFAULT_SWATH_UNIT: &str = "molecules/cm^2";

/// A decoded swath file
#[derive(Debug, Clone)]
pub struct SwathProduct {
    pub grid: SwathGrid,
    pub species: Parameter,
    pub unit: String,
}

/// Reads one satellite file into a grid. Called from blocking threads.
pub trait SwathReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<SwathProduct, SwathError>;
}

/// Parse a CF-style `"seconds since <epoch>"` units string
pub fn parse_time_units(units: &str) -> Option<OffsetDateTime> {
    let rest = units.trim().strip_prefix("seconds since")?.trim();
    if let Ok(t) = OffsetDateTime::parse(rest, &Rfc3339) {
        return Some(t);
    }
    let stripped = rest.trim_end_matches('Z').trim_end_matches(" UTC").trim();
    if let Ok(t) = PrimitiveDateTime::parse(
        stripped,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    ) {
        return Some(t.assume_utc());
    }
    if let Ok(t) = PrimitiveDateTime::parse(
        stripped,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    ) {
        return Some(t.assume_utc());
    }
    Date::parse(stripped, format_description!("[year]-[month]-[day]"))
        .ok()
        .map(|d| d.midnight().assume_utc())
}

/// Seconds offsets to timestamps; offsets that are non-finite or out of range stay unknown
pub fn scan_times_from_offsets(
    epoch: OffsetDateTime,
    offsets: &[f64],
) -> Vec<Option<OffsetDateTime>> {
    offsets
        .iter()
        .map(|&s| Duration::checked_seconds_f64(s).and_then(|d| epoch.checked_add(d)))
        .collect()
}

#[cfg(feature = "netcdf")]
pub use netcdf_reader::NetCdfSwathReader;

#[cfg(feature = "netcdf")]
mod netcdf_reader {
    use std::path::Path;

    use netcdf::AttributeValue;

    use super::{
        parse_time_units, scan_times_from_offsets, SwathProduct, DEFAULT_SWATH_UNIT, GPS_EPOCH,
    };
    use crate::{Parameter, SwathError, SwathGrid, SwathReader};

    /// TEMPO L2 layout: `product/<variable>` over (mirror_step, xtrack) and
    /// `geolocation/{latitude,longitude,time}`.
    pub struct NetCdfSwathReader {
        pub variable: String,
        pub species: Parameter,
    }

    impl Default for NetCdfSwathReader {
        fn default() -> Self {
            Self {
                variable: "vertical_column_troposphere".to_string(),
                species: Parameter::No2,
            }
        }
    }

    fn has_attr(var: &netcdf::Variable, name: &str) -> bool {
        var.attributes().any(|attr| attr.name() == name)
    }

    fn f64_attr(var: &netcdf::Variable, name: &str) -> Option<f64> {
        if !has_attr(var, name) {
            return None;
        }
        let value = var.attribute_value(name)?.ok()?;
        f64::try_from(value).ok()
    }

    fn str_attr(var: &netcdf::Variable, name: &str) -> Option<String> {
        if !has_attr(var, name) {
            return None;
        }
        match var.attribute_value(name)?.ok()? {
            AttributeValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn read_f64(var: &netcdf::Variable, path: &str) -> Result<Vec<f64>, SwathError> {
        let mut data: Vec<f64> = var.get_values::<f64, _>(..).map_err(|e| SwathError::Read {
            path: path.to_string(),
            reason: format!("reading {}: {}", var.name(), e),
        })?;
        if let Some(fill) = f64_attr(var, "_FillValue") {
            for v in data.iter_mut().filter(|v| **v == fill) {
                *v = f64::NAN;
            }
        }
        Ok(data)
    }

    impl SwathReader for NetCdfSwathReader {
        fn read(&self, path: &Path) -> Result<SwathProduct, SwathError> {
            let display = path.display().to_string();
            let fail = |reason: String| SwathError::Read {
                path: display.clone(),
                reason,
            };

            let file = netcdf::open(path).map_err(|e| fail(format!("open: {}", e)))?;
            let product = file
                .group("product")
                .map_err(|e| fail(e.to_string()))?
                .ok_or_else(|| fail("missing product group".to_string()))?;
            let geolocation = file
                .group("geolocation")
                .map_err(|e| fail(e.to_string()))?
                .ok_or_else(|| fail("missing geolocation group".to_string()))?;

            let value_var = product
                .variable(&self.variable)
                .ok_or_else(|| fail(format!("missing product/{}", self.variable)))?;
            let lat_var = geolocation
                .variable("latitude")
                .ok_or_else(|| fail("missing geolocation/latitude".to_string()))?;
            let lon_var = geolocation
                .variable("longitude")
                .ok_or_else(|| fail("missing geolocation/longitude".to_string()))?;
            let time_var = geolocation
                .variable("time")
                .ok_or_else(|| fail("missing geolocation/time".to_string()))?;

            let dims = lat_var.dimensions();
            if dims.len() != 2 {
                return Err(fail(format!("latitude has {} dimensions", dims.len())));
            }
            let (rows, cols) = (dims[0].len(), dims[1].len());

            let epoch = str_attr(&time_var, "units")
                .and_then(|u| parse_time_units(&u))
                .unwrap_or(GPS_EPOCH);
            let offsets = read_f64(&time_var, &display)?;
            let unit = str_attr(&value_var, "units").unwrap_or_else(|| DEFAULT_SWATH_UNIT.to_string());

            let grid = SwathGrid::new(
                rows,
                cols,
                read_f64(&lat_var, &display)?,
                read_f64(&lon_var, &display)?,
                read_f64(&value_var, &display)?,
                scan_times_from_offsets(epoch, &offsets),
            )?;

            Ok(SwathProduct {
                grid,
                species: self.species,
                unit,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn parses_common_time_unit_spellings() {
        assert_eq!(
            parse_time_units("seconds since 1980-01-06T00:00:00Z"),
            Some(GPS_EPOCH)
        );
        assert_eq!(
            parse_time_units("seconds since 1980-01-06 00:00:00"),
            Some(GPS_EPOCH)
        );
        assert_eq!(parse_time_units("seconds since 1980-01-06"), Some(GPS_EPOCH));
        assert_eq!(parse_time_units("days since 1980-01-06"), None);
    }

    #[test]
    fn offsets_become_scan_times() {
        let times = scan_times_from_offsets(GPS_EPOCH, &[1_407_510_000.0, f64::NAN]);
        assert_eq!(times[0], Some(datetime!(2024-08-12 15:00:00 UTC)));
        assert_eq!(times[1], None);
    }

    #[test]
    fn out_of_range_offsets_are_unknown() {
        let times = scan_times_from_offsets(GPS_EPOCH, &[1e300, -1e300, 3.0]);
        assert_eq!(times[0], None);
        assert_eq!(times[1], None);
        assert_eq!(times[2], Some(datetime!(1980-01-06 00:00:03 UTC)));
    }
}
