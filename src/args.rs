use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about, name = "hmmtrack-rs", color=clap::ColorChoice::Always, styles=get_styles())]
pub struct Arguments {
    /// File of GPS fixes. Format: delimited text with a header row and the
    /// columns bird, time, lon, lat, alt_baro, alt_gps. `time` is either
    /// "YYYY-MM-DD HH:MM:SS" (UTC) or epoch seconds. Altitudes are meters;
    /// empty cells are treated as missing and negative values are clamped to
    /// zero. Rows may be in any order; fixes are sorted per bird by time.
    #[arg(short = 'i', long, required = true, help_heading = "input data")]
    pub data_file: String,

    /// Optional: file of bird ids to exclude from all analysis. Format: no
    /// header, one id (string) per row.
    #[arg(short = 'b', long, help_heading = "input data")]
    pub exclude_file: Option<String>,

    /// Optional: flag indicating the input file is a binary cache of prepared
    /// observations written earlier with --to-bin-file
    #[arg(long, default_value_t = false, help_heading = "input data option")]
    pub from_bin: bool,

    /// Optional: field delimiter of the input file
    #[arg(long, default_value_t = ',', help_heading = "input data option")]
    pub delimiter: char,

    /// Optional: TOML file of fit tuning constants (observation floors, kappa
    /// cap, k-means iteration cap). If not provided, builtin defaults are
    /// used and written next to the output for the record.
    #[arg(long, help_heading = "input data option")]
    pub model_config: Option<String>,

    /// output prefix, if not specified use the `-i` option value as prefix.
    #[arg(short = 'o', long, help_heading = "output data")]
    pub output: Option<String>,

    /// whether to suppress the behavioral-bout output. Toggle this on for
    /// minimal IO burden when only per-fix states are needed
    #[arg(long, default_value_t = false, help_heading = "output option")]
    pub suppress_bouts: bool,

    /// When set, prepared observations (after cleaning, trip segmentation and
    /// step/angle derivation) are written to a binary cache file and the fit
    /// is skipped.
    #[arg(long, default_value_t = false, help_heading = "output option")]
    pub to_bin_file: bool,

    // ---- preprocessing options
    /// a new trip starts whenever consecutive fixes of a bird are separated
    /// by more than this many seconds
    #[arg(long, default_value_t = 3600, help_heading = "preprocessing option")]
    pub max_time_gap: i64,

    /// trips with fewer fixes than this are dropped
    #[arg(long, default_value_t = 10, help_heading = "preprocessing option")]
    pub min_trip_points: usize,

    /// Optional: drop fixes implying a ground speed above this (m/s)
    #[arg(long, help_heading = "preprocessing option")]
    pub max_speed: Option<f64>,

    // ---- hmm options
    /// number of behavioral states to fit
    #[arg(short = 'k', long, default_value_t = 3, help_heading = "hmm option")]
    pub n_states: usize,

    /// Optional: Maximum number of EM iterations
    #[arg(short = 'm', long, default_value = "200", help_heading = "hmm option")]
    pub max_iter: u32,

    /// convergence criteria: min log-likelihood gain per iteration
    #[arg(long, default_value_t = 1e-4, help_heading = "hmm option")]
    pub fit_thresh_dloglik: f64,

    /// convergence criteria: min absolute change of any emission parameter
    #[arg(long, default_value_t = 1e-3, help_heading = "hmm option")]
    pub fit_thresh_dparam: f64,

    /// seed for the k-means starting-value selection
    #[arg(long, default_value_t = 42, help_heading = "hmm option")]
    pub kmeans_seed: u64,

    // ---- memory buffer
    /// output buffer size for per-fix state records, by default 8Kb. When IO
    /// is slow it can be beneficial to set this to a larger value to reduce
    /// the number of system IO calls
    #[arg(long, help_heading = "memory option")]
    pub buffer_size_states: Option<usize>,

    /// output buffer size for bout records, used similarly to
    /// --buffer-size-states
    #[arg(long, help_heading = "memory option")]
    pub buffer_size_bouts: Option<usize>,

    // ---- parallelization
    /// number of threads. 0 : use all cpus; non-zero: use the given numbers
    /// of threads
    #[arg(long, default_value_t = 0, help_heading = "parallelization option")]
    pub num_threads: usize,

    /// print a progress line per fitted source (log-likelihood, iterations,
    /// elapsed seconds) to stderr
    #[arg(long, default_value_t = false, help_heading = "parallelization option")]
    pub print_progress: bool,
}

impl Arguments {
    pub fn new_for_test() -> Self {
        Self {
            data_file: String::from("testdata/tracks.csv"),
            exclude_file: None,
            from_bin: false,
            delimiter: ',',
            model_config: None,
            output: Some("tmp_hmmtrackrs".into()),
            suppress_bouts: false,
            to_bin_file: false,
            max_time_gap: 3600,
            min_trip_points: 10,
            max_speed: Some(50.0),
            n_states: 3,
            max_iter: 200,
            fit_thresh_dloglik: 1e-4,
            fit_thresh_dparam: 1e-3,
            kmeans_seed: 42,
            buffer_size_states: Some(1_000_000),
            buffer_size_bouts: Some(10_000),
            num_threads: 1,
            print_progress: false,
        }
    }
}

pub fn get_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .usage(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
        )
        .header(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
        )
        .literal(
            anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
        )
        .invalid(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
        )
        .error(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
        )
        .valid(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
        )
        .placeholder(
            anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::White))),
        )
}
