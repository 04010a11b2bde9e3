pub mod authority;
pub mod clock;
pub mod compensator;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod latency;
pub mod logging;
pub mod media;
pub mod metronome;
pub mod net;
pub mod protocol;
pub mod scheduler;
pub mod smoothing;
pub mod status;
pub mod traits;
