use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    args::Arguments,
    cluster,
    matrix::{AsOption, Matrix, MatrixBuilder},
    stats::wrap_angle,
    track::{self, bearing_rad, haversine_m, PrepOptions, Tracks},
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error, source {source:?}, file: {file:?}")]
    Io {
        source: std::io::Error,
        file: Option<String>,
    },
    #[error("track error: {0:?}")]
    Track(#[from] track::Error),
    #[error("cluster error: {0:?}")]
    Cluster(#[from] cluster::Error),
    #[error("bincode error: {0:?}")]
    Bincode(#[from] bincode::Error),
    #[error("toml serialize error: {0:?}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("toml deserialize error: {0:?}")]
    TomlDeserialize(#[from] toml::de::Error),
    #[error("lockerror: {0}")]
    LockError(&'static str),
    #[error("{0}")]
    CliArgError(&'static str),
}

/// Which altitude measurement feeds the altitude emission stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltSource {
    Baro,
    Gps,
}

impl AltSource {
    pub const ALL: [AltSource; 2] = [AltSource::Baro, AltSource::Gps];

    pub fn as_str(&self) -> &'static str {
        match self {
            AltSource::Baro => "baro",
            AltSource::Gps => "gps",
        }
    }

    /// observation matrix column holding this source's altitude
    pub fn obs_col(&self) -> usize {
        match self {
            AltSource::Baro => OBS_ALT_BARO,
            AltSource::Gps => OBS_ALT_GPS,
        }
    }
}

// observation matrix columns
pub const OBS_STEP: usize = 0;
pub const OBS_ANGLE: usize = 1;
pub const OBS_ALT_BARO: usize = 2;
pub const OBS_ALT_GPS: usize = 3;
pub const OBS_NCOLS: usize = 4;

/// Reject bad argument combinations before any input is read. Decoded states
/// travel as `u8`, which bounds `--n-states`.
pub fn validate_args(args: &Arguments) -> Result<()> {
    if args.from_bin && args.to_bin_file {
        return Err(Error::CliArgError(
            "--from-bin and --to-bin-file are mutually exclusive",
        ));
    }
    if args.n_states == 0 {
        return Err(Error::CliArgError("--n-states must be at least 1"));
    }
    if args.n_states > u8::MAX as usize {
        return Err(Error::CliArgError("--n-states must be at most 255"));
    }
    if !args.delimiter.is_ascii() {
        return Err(Error::CliArgError(
            "--delimiter must be a single ascii character",
        ));
    }
    Ok(())
}

/// Fit tuning constants, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// gamma observations cannot sit on the zero boundary; exact zeros are
    /// lifted to these floors (meters)
    pub step_floor_m: f64,
    pub alt_floor_m: f64,
    /// cap on the von Mises concentration during re-estimation
    pub kappa_max: f64,
    /// floor for initial-state and transition probabilities
    pub prob_floor: f64,
    /// iteration cap for the k-means starting-value search
    pub kmeans_max_iter: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            step_floor_m: 1.0,
            alt_floor_m: 0.1,
            kappa_max: 100.0,
            prob_floor: 1e-5,
            kmeans_max_iter: 100,
        }
    }
}

impl ModelConfig {
    pub fn new_from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path.as_ref()).map_err(|source| Error::Io {
            source,
            file: Some(path.as_ref().to_string_lossy().to_string()),
        })?;
        Ok(toml::from_str(&s)?)
    }
}

/// Prepared observations written to / read from the binary cache.
#[derive(Deserialize)]
struct PreparedData {
    tracks: Tracks,
    obs_flat: Vec<f64>,
    nrows: usize,
}

/// Borrowed twin of [`PreparedData`] for writing (bincode encodes both
/// layouts identically).
#[derive(Serialize)]
struct PreparedDataRef<'a> {
    tracks: &'a Tracks,
    obs_flat: Vec<f64>,
    nrows: usize,
}

pub struct InputData {
    pub args: Arguments,
    pub config: ModelConfig,
    pub tracks: Tracks,
    /// nfixes x OBS_NCOLS, NaN = missing
    pub obs: Matrix<f64>,
}

impl InputData {
    pub fn from_args(args: &Arguments) -> Result<Self> {
        let config = match args.model_config.as_ref() {
            Some(path) => ModelConfig::new_from_toml_file(path),
            None => {
                let config = ModelConfig::default();
                std::fs::write("tmp_model_config.toml", toml::to_string(&config)?).map_err(
                    |e| Error::Io {
                        source: e,
                        file: args.model_config.to_owned(),
                    },
                )?;
                eprintln!(concat!(
                    "WARN: --model-config not specified, builtin constants are used",
                    " and are written to 'tmp_model_config.toml'",
                ));
                Ok(config)
            }
        }?;

        if args.from_bin {
            let prepared = Self::read_bin_file(&args.data_file)?;
            let nrows = prepared.nrows;
            let mut builder = MatrixBuilder::<f64>::new(OBS_NCOLS);
            for v in prepared.obs_flat.into_iter() {
                builder.push(v.as_option());
            }
            let obs = builder.finish();
            assert_eq!(obs.get_nrows(), nrows);
            return Ok(Self {
                args: args.clone(),
                config,
                tracks: prepared.tracks,
                obs,
            });
        }

        let excluded = match args.exclude_file.as_ref() {
            Some(path) => Self::read_exclude_file(path)?,
            None => HashSet::new(),
        };
        let prep = PrepOptions {
            max_time_gap_secs: args.max_time_gap,
            min_trip_points: args.min_trip_points,
            max_speed_mps: args.max_speed,
        };
        let delimiter = args.delimiter as u8;
        let tracks = Tracks::from_csv(&args.data_file, &excluded, &prep, delimiter)?;
        let obs = Self::derive_observations(&tracks, &config);

        Ok(Self {
            args: args.clone(),
            config,
            tracks,
            obs,
        })
    }

    fn read_exclude_file(path: &str) -> Result<HashSet<String>> {
        let f = std::fs::File::open(path)
            .map(BufReader::new)
            .map_err(|source| Error::Io {
                source,
                file: Some(path.to_owned()),
            })?;
        let mut set = HashSet::new();
        for line in f.lines() {
            let line = line.map_err(|source| Error::Io {
                source,
                file: Some(path.to_owned()),
            })?;
            let id = line.trim();
            if !id.is_empty() {
                set.insert(id.to_owned());
            }
        }
        Ok(set)
    }

    /// Build the observation matrix: per fix, step length from the previous
    /// fix, turning angle at the fix, and both altitude streams. Steps and
    /// angles never cross trip boundaries.
    pub fn derive_observations(tracks: &Tracks, config: &ModelConfig) -> Matrix<f64> {
        let fixes = tracks.fixes();
        let mut builder = MatrixBuilder::<f64>::new(OBS_NCOLS);

        for trip in 0..tracks.ntrips() {
            let (start, end) = tracks.get_trip_idx_ranges(trip);
            for t in start..end {
                // step from previous fix
                let step = if t == start {
                    None
                } else {
                    let (p, q) = (&fixes[t - 1], &fixes[t]);
                    let d = haversine_m(p.lat, p.lon, q.lat, q.lon);
                    Some(d.max(config.step_floor_m))
                };
                // turn between the two incoming headings
                let angle = if t < start + 2 {
                    None
                } else {
                    let (a, b, c) = (&fixes[t - 2], &fixes[t - 1], &fixes[t]);
                    let h1 = bearing_rad(a.lat, a.lon, b.lat, b.lon);
                    let h2 = bearing_rad(b.lat, b.lon, c.lat, c.lon);
                    Some(wrap_angle(h2 - h1))
                };
                let alt_baro = fixes[t]
                    .alt_baro
                    .as_option()
                    .map(|a| a.max(config.alt_floor_m));
                let alt_gps = fixes[t]
                    .alt_gps
                    .as_option()
                    .map(|a| a.max(config.alt_floor_m));

                builder.push(step);
                builder.push(angle);
                builder.push(alt_baro);
                builder.push(alt_gps);
            }
        }
        builder.finish()
    }

    pub fn step(&self, t: usize) -> f64 {
        self.obs.get_at(t, OBS_STEP)
    }
    pub fn angle(&self, t: usize) -> f64 {
        self.obs.get_at(t, OBS_ANGLE)
    }
    pub fn alt(&self, t: usize, source: AltSource) -> f64 {
        self.obs.get_at(t, source.obs_col())
    }

    pub fn write_bin_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let nrows = self.obs.get_nrows();
        let mut obs_flat = Vec::with_capacity(nrows * OBS_NCOLS);
        for row in 0..nrows {
            obs_flat.extend_from_slice(self.obs.get_row_raw_slice(row));
        }
        let prepared = PreparedDataRef {
            tracks: &self.tracks,
            obs_flat,
            nrows,
        };
        let file = std::fs::File::create(path.as_ref()).map_err(|source| Error::Io {
            source,
            file: Some(path.as_ref().to_string_lossy().to_string()),
        })?;
        bincode::serialize_into(BufWriter::new(file), &prepared)?;
        Ok(())
    }

    fn read_bin_file(path: &str) -> Result<PreparedData> {
        let file = std::fs::File::open(path).map_err(|source| Error::Io {
            source,
            file: Some(path.to_owned()),
        })?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }
}

pub fn fmt_time(epoch: i64) -> String {
    match chrono::DateTime::from_timestamp(epoch, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => epoch.to_string(),
    }
}

fn fmt_na(x: f64) -> String {
    if x.is_nan() {
        "NA".to_string()
    } else {
        format!("{x:.1}")
    }
}

pub struct StateRecord<'a> {
    pub bird: &'a str,
    pub trip: u32,
    pub source: &'static str,
    pub time: i64,
    pub lon: f64,
    pub lat: f64,
    pub altitude: f64,
    pub state: u8,
    pub label: &'a str,
}

pub struct BoutRecord<'a> {
    pub bird: &'a str,
    pub trip: u32,
    pub source: &'static str,
    pub label: &'a str,
    pub start_time: i64,
    pub end_time: i64,
    pub n_fixes: usize,
}

pub struct OutputFiles {
    pub state_file: Arc<Mutex<BufWriter<File>>>,
    pub bout_file: Arc<Mutex<BufWriter<File>>>,
}

impl OutputFiles {
    pub fn new_from_args(
        args: &Arguments,
        buffer_size_states: Option<usize>,
        buffer_size_bouts: Option<usize>,
    ) -> Result<Self> {
        let prefix = match args.output.as_ref() {
            Some(output) => output,
            None => &args.data_file,
        };
        let state_fn = format!("{prefix}.states.txt");
        let bout_fn = format!("{prefix}.bouts.txt");

        let mut state_file = match buffer_size_states {
            Some(bfsz) => {
                std::fs::File::create(&state_fn).map(|f| BufWriter::with_capacity(bfsz, f))
            }
            None => std::fs::File::create(&state_fn).map(BufWriter::new),
        }
        .map_err(|e| Error::Io {
            source: e,
            file: Some(state_fn.clone()),
        })?;

        let mut bout_file = match buffer_size_bouts {
            Some(bfsz) => {
                std::fs::File::create(&bout_fn).map(|f| BufWriter::with_capacity(bfsz, f))
            }
            None => std::fs::File::create(&bout_fn).map(BufWriter::new),
        }
        .map_err(|e| Error::Io {
            source: e,
            file: Some(bout_fn.clone()),
        })?;

        writeln!(
            &mut state_file,
            "bird\ttrip\tsource\ttime\tlon\tlat\taltitude\tstate\tlabel"
        )
        .map_err(|e| Error::Io {
            source: e,
            file: Some(state_fn.clone()),
        })?;

        writeln!(
            &mut bout_file,
            "bird\ttrip\tsource\tlabel\tstart\tend\tn_fixes\tduration_s"
        )
        .map_err(|e| Error::Io {
            source: e,
            file: Some(bout_fn.clone()),
        })?;

        Ok(Self {
            state_file: Arc::new(Mutex::new(state_file)),
            bout_file: Arc::new(Mutex::new(bout_file)),
        })
    }
}

pub struct OutputBuffer<'a> {
    state_file: Arc<Mutex<BufWriter<File>>>,
    bout_file: Arc<Mutex<BufWriter<File>>>,
    states: SmallVec<[StateRecord<'a>; 32]>,
    bouts: SmallVec<[BoutRecord<'a>; 8]>,
}

impl<'a> OutputBuffer<'a> {
    pub fn new(out: &OutputFiles, states_capacity: usize, bouts_capacity: usize) -> Self {
        Self {
            state_file: Arc::clone(&out.state_file),
            bout_file: Arc::clone(&out.bout_file),
            states: SmallVec::with_capacity(states_capacity),
            bouts: SmallVec::with_capacity(bouts_capacity),
        }
    }

    pub fn add_state(&mut self, rec: StateRecord<'a>) -> Result<()> {
        if self.states.len() == self.states.capacity() {
            self.flush_states()?;
        }
        self.states.push(rec);
        Ok(())
    }

    pub fn add_bout(&mut self, rec: BoutRecord<'a>) -> Result<()> {
        if self.bouts.len() == self.bouts.capacity() {
            self.flush_bouts()?;
        }
        self.bouts.push(rec);
        Ok(())
    }

    pub fn flush_states(&mut self) -> Result<()> {
        let mut file = self
            .state_file
            .lock()
            .map_err(|_| Error::LockError("flush_states"))?;
        for rec in self.states.iter() {
            writeln!(
                file,
                "{}\t{}\t{}\t{}\t{:.6}\t{:.6}\t{}\t{}\t{}",
                rec.bird,
                rec.trip,
                rec.source,
                fmt_time(rec.time),
                rec.lon,
                rec.lat,
                fmt_na(rec.altitude),
                rec.state,
                rec.label,
            )
            .map_err(|e| Error::Io {
                source: e,
                file: None,
            })?;
        }
        self.states.clear();
        Ok(())
    }

    pub fn flush_bouts(&mut self) -> Result<()> {
        let mut file = self
            .bout_file
            .lock()
            .map_err(|_| Error::LockError("flush_bouts"))?;
        for rec in self.bouts.iter() {
            writeln!(
                file,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                rec.bird,
                rec.trip,
                rec.source,
                rec.label,
                fmt_time(rec.start_time),
                fmt_time(rec.end_time),
                rec.n_fixes,
                rec.end_time - rec.start_time,
            )
            .map_err(|e| Error::Io {
                source: e,
                file: None,
            })?;
        }
        self.bouts.clear();
        Ok(())
    }
}

/// Write the per-state fitted parameters of every source to
/// `{prefix}.params.txt`. One row per (source, state); the transition row is
/// comma-joined into a single column since n_states is run-time.
pub fn write_params_file(
    args: &Arguments,
    fits: &[(AltSource, &crate::model::ModelParamState, &[String])],
) -> Result<()> {
    let prefix = match args.output.as_ref() {
        Some(output) => output,
        None => &args.data_file,
    };
    let params_fn = format!("{prefix}.params.txt");
    let mut f = std::fs::File::create(&params_fn)
        .map(BufWriter::new)
        .map_err(|e| Error::Io {
            source: e,
            file: Some(params_fn.clone()),
        })?;

    let werr = |e| Error::Io {
        source: e,
        file: Some(params_fn.clone()),
    };
    writeln!(
        &mut f,
        "source\tstate\tlabel\tpi\tstep_shape\tstep_rate\tstep_mean\tstep_sd\t\
         alt_shape\talt_rate\talt_mean\talt_sd\tangle_mu\tangle_kappa\t\
         trans_row\tloglik\tn_iter"
    )
    .map_err(|e| werr(e))?;

    for (source, ms, label_names) in fits.iter() {
        let model = &ms.model;
        let n = model.n_states();
        for i in 0..n {
            let s = &model.states[i];
            let trans_row = (0..n)
                .map(|j| format!("{:.5}", model.trans_at(i, j)))
                .join(",");
            writeln!(
                &mut f,
                "{}\t{}\t{}\t{:.5}\t{:.5}\t{:.6}\t{:.2}\t{:.2}\t{:.5}\t{:.6}\t{:.2}\t{:.2}\t{:.4}\t{:.4}\t{}\t{:.4}\t{}",
                source.as_str(),
                i,
                label_names[i],
                model.pi[i],
                s.step.shape,
                s.step.rate,
                s.step.mean(),
                s.step.sd(),
                s.alt.shape,
                s.alt.rate,
                s.alt.mean(),
                s.alt.sd(),
                s.angle.mu,
                s.angle.kappa,
                trans_row,
                model.loglik,
                ms.iiter + 1,
            )
            .map_err(|e| werr(e))?;
        }
    }
    Ok(())
}

/// Write the baro/gps comparison table to `{prefix}.compare.txt`.
pub fn write_compare_file(args: &Arguments, rendered: &str) -> Result<()> {
    let prefix = match args.output.as_ref() {
        Some(output) => output,
        None => &args.data_file,
    };
    let compare_fn = format!("{prefix}.compare.txt");
    std::fs::write(&compare_fn, rendered).map_err(|e| Error::Io {
        source: e,
        file: Some(compare_fn),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Fix;

    fn single_trip_tracks() -> Tracks {
        let mut fixes = vec![];
        for t in 0..6 {
            fixes.push(Fix {
                bird: 0,
                time: t * 60,
                lon: -14.35 + t as f64 * 0.001,
                lat: -7.95,
                alt_baro: if t == 2 { f64::NAN } else { 5.0 * t as f64 },
                alt_gps: 0.0,
            });
        }
        let prep = PrepOptions {
            max_time_gap_secs: 600,
            min_trip_points: 3,
            max_speed_mps: None,
        };
        Tracks::from_fixes(vec!["A1".into()], fixes, &prep).unwrap()
    }

    #[test]
    fn observation_layout_and_edges() {
        let tracks = single_trip_tracks();
        let config = ModelConfig::default();
        let obs = InputData::derive_observations(&tracks, &config);
        assert_eq!(obs.get_nrows(), tracks.nfixes());
        assert_eq!(obs.get_ncols(), OBS_NCOLS);
        // first fix of the trip: no step, no angle
        assert!(obs.get_at(0, OBS_STEP).is_nan());
        assert!(obs.get_at(0, OBS_ANGLE).is_nan());
        // second: step but no angle yet
        assert!(obs.get_at(1, OBS_STEP) > 0.0);
        assert!(obs.get_at(1, OBS_ANGLE).is_nan());
        // third: both present
        assert!(obs.get_at(2, OBS_STEP) > 0.0);
        assert!(!obs.get_at(2, OBS_ANGLE).is_nan());
        // missing barometric altitude propagates
        assert!(obs.get_at(2, OBS_ALT_BARO).is_nan());
        // zero gps altitude is floored off the gamma boundary
        assert_eq!(obs.get_at(0, OBS_ALT_GPS), config.alt_floor_m);
    }

    #[test]
    fn bin_cache_roundtrip() {
        let tracks = single_trip_tracks();
        let config = ModelConfig::default();
        let obs = InputData::derive_observations(&tracks, &config);
        let mut args = Arguments::new_for_test();
        let input = InputData {
            args: args.clone(),
            config,
            tracks,
            obs,
        };
        let path = std::env::temp_dir().join("hmmtrackrs_test_cache.bin");
        input.write_bin_file(&path).unwrap();

        args.from_bin = true;
        args.data_file = path.to_string_lossy().to_string();
        let reread = InputData::from_args(&args).unwrap();
        assert_eq!(reread.tracks.nfixes(), input.tracks.nfixes());
        assert_eq!(reread.obs.get_nrows(), input.obs.get_nrows());
        for t in 0..input.obs.get_nrows() {
            for c in 0..OBS_NCOLS {
                let (a, b) = (input.obs.get_at(t, c), reread.obs.get_at(t, c));
                assert!(a == b || (a.is_nan() && b.is_nan()));
            }
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn arg_validation_rejects_bad_combinations() {
        let mut args = Arguments::new_for_test();
        assert!(validate_args(&args).is_ok());
        args.n_states = 0;
        assert!(matches!(validate_args(&args), Err(Error::CliArgError(_))));
        // state indices are u8 end to end
        args.n_states = 300;
        assert!(matches!(validate_args(&args), Err(Error::CliArgError(_))));
        args.n_states = 255;
        assert!(validate_args(&args).is_ok());
        args.from_bin = true;
        args.to_bin_file = true;
        assert!(validate_args(&args).is_err());
    }

    #[test]
    fn model_config_toml_roundtrip() {
        let config = ModelConfig {
            step_floor_m: 2.0,
            ..Default::default()
        };
        let s = toml::to_string(&config).unwrap();
        let back: ModelConfig = toml::from_str(&s).unwrap();
        assert_eq!(back.step_floor_m, 2.0);
        assert_eq!(back.kappa_max, config.kappa_max);
    }
}
