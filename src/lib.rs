// fix table per bird
// - from csv file
// - remove excluded birds
// - split into trips on time gaps
// - derive step / turning angle / altitude observations

// ProgArguments

// model
// - pi, transition matrix
// - per-state gamma (step, altitude) and von Mises (angle) emissions

// HmmRunner
// - per altitude source
// - EM fit (scaled forward/backward over trips)
// - Viterbi decode
// - bout extraction

// DataHandler
// - parameters (floors, caps)
// - observation matrix (NaN = missing)
// - tracks
// - output buffers

pub mod args;
pub mod cluster;
pub mod compare;
pub mod data;
pub mod hmm;
pub mod label;
pub mod matrix;
pub mod model;
pub mod stats;
pub mod track;
