pub mod backend;
pub mod bay;
pub mod chan;
pub mod clkoff;
pub mod cpu;
pub mod emu;
pub mod error;
pub mod model;
pub mod models;
pub mod mux;
pub mod num_util;
pub mod player;
pub mod recorder;
pub mod serialize;
pub mod stream;
pub mod system;
pub mod task;
pub mod thread;
pub mod trace;
pub mod value;
