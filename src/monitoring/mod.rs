pub mod live;

pub use live::{LiveOptions, LiveState, LiveView};
