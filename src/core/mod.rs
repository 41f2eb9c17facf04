//! Runtime of the bridge: query evaluation, publishing and the cycle loop.

pub mod deadline;
pub mod prometheus;
pub mod publisher;
pub mod scraper;
pub mod settings;
pub mod ticker;
