// Frame processing pipeline: detection, mask synthesis and ordered output

pub mod detection;
pub mod detection_worker;
pub mod finalize;
pub mod geometry;
pub mod masking;
pub mod orchestrator;
pub mod reader;
pub mod reassembly;
pub mod types;
