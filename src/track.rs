use std::collections::HashSet;
use std::io::BufReader;
use std::ops::Range;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error, source {source:?}, file: {file:?}")]
    Io {
        source: std::io::Error,
        file: Option<String>,
    },
    #[error("csv error: {0:?}")]
    Csv(#[from] csv::Error),
    #[error("cannot parse timestamp {value:?} on row {row}")]
    ParseTime { value: String, row: usize },
    #[error("no usable fixes after cleaning (excluded birds / gap filtering)")]
    NoFixes,
}

/// One CSV row: one GPS fix. Missing altitude cells deserialize to `None`.
#[derive(Debug, Deserialize)]
pub struct FixRecord {
    pub bird: String,
    pub time: String,
    pub lon: f64,
    pub lat: f64,
    pub alt_baro: Option<f64>,
    pub alt_gps: Option<f64>,
}

/// A cleaned fix. Altitudes are NaN when missing, clamped at zero otherwise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fix {
    /// index into `Tracks::birds`
    pub bird: u32,
    /// epoch seconds
    pub time: i64,
    pub lon: f64,
    pub lat: f64,
    pub alt_baro: f64,
    pub alt_gps: f64,
}

/// Preprocessing knobs, filled from the CLI arguments.
#[derive(Debug, Clone, Copy)]
pub struct PrepOptions {
    /// a new trip starts when consecutive fixes are further apart than this
    pub max_time_gap_secs: i64,
    /// trips with fewer fixes than this are dropped
    pub min_trip_points: usize,
    /// fixes implying a ground speed above this (m/s) are dropped
    pub max_speed_mps: Option<f64>,
}

/// All fixes of all birds, sorted by (bird, time), segmented into trips.
///
/// Trip index ranges play the role the per-chromosome site ranges play in a
/// genome-wide fit: each trip is an independent observation sequence fitted
/// under shared model parameters.
#[derive(Serialize, Deserialize)]
pub struct Tracks {
    birds: Vec<String>,
    fixes: Vec<Fix>,
    trip_ranges: Vec<Range<u32>>,
    /// bird index per trip
    trip_bird: Vec<u32>,
    /// trip number within its bird (1-based)
    trip_num: Vec<u32>,
}

impl Tracks {
    pub fn from_csv(
        path: impl AsRef<Path>,
        excluded: &HashSet<String>,
        prep: &PrepOptions,
        delimiter: u8,
    ) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref()).map_err(|source| Error::Io {
            source,
            file: Some(path.as_ref().to_string_lossy().to_string()),
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(BufReader::new(file));

        let mut birds: Vec<String> = vec![];
        let mut fixes: Vec<Fix> = vec![];
        for (irow, rec) in reader.deserialize::<FixRecord>().enumerate() {
            let rec = rec?;
            if excluded.contains(&rec.bird) {
                continue;
            }
            let time = parse_time(&rec.time).ok_or_else(|| Error::ParseTime {
                value: rec.time.clone(),
                row: irow + 2,
            })?;
            let bird = match birds.iter().position(|b| b == &rec.bird) {
                Some(i) => i as u32,
                None => {
                    birds.push(rec.bird.clone());
                    (birds.len() - 1) as u32
                }
            };
            fixes.push(Fix {
                bird,
                time,
                lon: rec.lon,
                lat: rec.lat,
                alt_baro: clean_altitude(rec.alt_baro),
                alt_gps: clean_altitude(rec.alt_gps),
            });
        }

        Self::from_fixes(birds, fixes, prep)
    }

    /// Sort, deduplicate, speed-filter, and segment raw fixes into trips.
    pub fn from_fixes(birds: Vec<String>, mut fixes: Vec<Fix>, prep: &PrepOptions) -> Result<Self> {
        fixes.sort_by_key(|f| (f.bird, f.time));
        fixes.dedup_by_key(|f| (f.bird, f.time));

        if let Some(max_speed) = prep.max_speed_mps {
            fixes = Self::speed_filter(fixes, max_speed, prep.max_time_gap_secs);
        }

        // trip segmentation on bird change or time gap
        let mut kept: Vec<Fix> = Vec::with_capacity(fixes.len());
        let mut trip_ranges: Vec<Range<u32>> = vec![];
        let mut trip_bird: Vec<u32> = vec![];
        let mut trip_num: Vec<u32> = vec![];
        let mut trip_counter_per_bird: Vec<u32> = vec![0; birds.len()];

        let mut i = 0;
        while i < fixes.len() {
            let mut j = i + 1;
            while j < fixes.len()
                && fixes[j].bird == fixes[i].bird
                && fixes[j].time - fixes[j - 1].time <= prep.max_time_gap_secs
            {
                j += 1;
            }
            if j - i >= prep.min_trip_points {
                let start = kept.len() as u32;
                kept.extend_from_slice(&fixes[i..j]);
                let bird = fixes[i].bird;
                trip_ranges.push(start..kept.len() as u32);
                trip_bird.push(bird);
                trip_counter_per_bird[bird as usize] += 1;
                trip_num.push(trip_counter_per_bird[bird as usize]);
            }
            i = j;
        }

        if kept.is_empty() {
            return Err(Error::NoFixes);
        }

        Ok(Self {
            birds,
            fixes: kept,
            trip_ranges,
            trip_bird,
            trip_num,
        })
    }

    fn speed_filter(fixes: Vec<Fix>, max_speed: f64, max_gap: i64) -> Vec<Fix> {
        let mut out: Vec<Fix> = Vec::with_capacity(fixes.len());
        for f in fixes.into_iter() {
            match out.last() {
                Some(last) if last.bird == f.bird && f.time - last.time <= max_gap => {
                    let dt = (f.time - last.time) as f64;
                    if dt <= 0.0 {
                        continue;
                    }
                    let d = haversine_m(last.lat, last.lon, f.lat, f.lon);
                    if d / dt <= max_speed {
                        out.push(f);
                    }
                }
                _ => out.push(f),
            }
        }
        out
    }

    pub fn nfixes(&self) -> usize {
        self.fixes.len()
    }
    pub fn ntrips(&self) -> usize {
        self.trip_ranges.len()
    }
    pub fn fixes(&self) -> &[Fix] {
        &self.fixes
    }
    pub fn bird_name(&self, bird: u32) -> &str {
        &self.birds[bird as usize]
    }

    pub fn get_trip_idx_ranges(&self, trip: usize) -> (usize, usize) {
        let r = &self.trip_ranges[trip];
        (r.start as usize, r.end as usize)
    }
    pub fn trip_bird(&self, trip: usize) -> u32 {
        self.trip_bird[trip]
    }
    pub fn trip_num(&self, trip: usize) -> u32 {
        self.trip_num[trip]
    }
}

fn clean_altitude(alt: Option<f64>) -> f64 {
    match alt {
        Some(a) if a.is_finite() => a.max(0.0),
        _ => f64::NAN,
    }
}

fn parse_time(s: &str) -> Option<i64> {
    let s = s.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    s.parse::<i64>().ok()
}

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlam = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlam / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Initial bearing from point 1 to point 2, radians in (-pi, pi].
pub fn bearing_rad(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dlam = (lon2 - lon1).to_radians();
    let y = dlam.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlam.cos();
    y.atan2(x)
}
