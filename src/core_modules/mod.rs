pub mod bounding_box;
pub mod classifier;
pub mod feature_dump;
pub mod features;
pub mod frame;
pub mod group_tagger;
pub mod hough;
pub mod image_sequence;
pub mod outlier_detector;
pub mod outlier_group;
pub mod paint_policy;
pub mod pixel;
pub mod pixel_buffer;
pub mod reconcile;
pub mod utils;
