mod key;
mod layout;
mod record;

pub use layout::{cf_names, SkipstreamLts};
