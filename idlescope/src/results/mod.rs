//! Result series and publication hooks

pub mod sink;
pub mod store;

pub use sink::{ChannelSink, LogSink, NullSink, RoundSink};
pub use store::ResultSeries;
