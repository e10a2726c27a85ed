pub mod catalog;
pub mod evacuation;
pub mod formation;
pub mod merge_heap;
pub mod merger;
pub mod params;
pub mod progress;
pub mod run;
pub mod sorter;

pub use self::sorter::{MergeSorter, SorterState};
