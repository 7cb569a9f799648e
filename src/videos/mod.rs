//! Video catalogue used for recommendations.

mod import;
mod index;

pub use import::{import_csv, parse_catalogue, VideoRecord};
pub use index::{SqliteVideoIndex, VideoDetails, VideoIndex};
