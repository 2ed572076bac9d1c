pub mod bus;
pub mod channel;
pub mod clock;
pub mod config;
pub mod playback;
pub mod resolver;
pub mod schedule;
pub mod server;
pub mod switcher;

#[cfg(test)]
mod testing;
