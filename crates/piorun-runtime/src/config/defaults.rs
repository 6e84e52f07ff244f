//! Compile-time defaults, generated by `build.rs`.
//!
//! Override at build time with `PIO_CONFIG_RS=/path/to/pio_config.rs`.

include!(concat!(env!("OUT_DIR"), "/pio_merged_config.rs"));
