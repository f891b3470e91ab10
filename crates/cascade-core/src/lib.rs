//! Cascade R-CNN refinement core
//!
//! A sequence of detection stages, each matched against ground truth at a
//! stricter IoU threshold than the last, where every stage consumes the boxes
//! regressed by the stage before it.
//!
//! # Layout
//!
//! - [`boxes`]: box geometry, IoU and clipping
//! - [`codec`]: delta encoding and decoding with per-stage normalization
//! - [`matcher`]: best-overlap assignment of candidates to ground truth
//! - [`sampler`]: balanced foreground/background resampling for training
//! - [`head`]: the per-stage head seam and a replaying implementation
//! - [`cascade`]: the controller that threads boxes through the stages
//! - [`ensemble`]: cross-stage score combination and class-wise NMS
//!
//! # Example
//!
//! ```no_run
//! use cascade_rcnn_core::{CascadeConfig, CascadeController, ImageInput, RecordedHead, RecordedStage};
//!
//! # fn run(image: ImageInput, recording: Vec<RecordedStage>) -> cascade_rcnn_core::Result<()> {
//! let config = CascadeConfig::default();
//! let head = RecordedHead::new(config.num_classes);
//! let controller = CascadeController::new(config)?;
//!
//! for det in controller.detect(&head, &image, &recording)? {
//!     println!("class {} score {:.2} at {:?}", det.class_id, det.score, det.bbox);
//! }
//! # Ok(())
//! # }
//! ```

pub mod boxes;
pub mod cascade;
pub mod codec;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod head;
pub mod matcher;
pub mod metrics;
pub mod sampler;
pub mod stage;

pub use boxes::{BBox, GroundTruthBox, ImageSize, ScoredBox};
pub use cascade::{image_seed, CascadeController, CascadePhase, CascadeState, ImageInput};
pub use codec::{BoxCoder, BoxDelta, Normalization, DELTA_SCALE_CLAMP};
pub use config::{CascadeConfig, InferenceConfig, StageConfig, TrainingConfig};
pub use ensemble::{class_wise_nms, Detection, DetectionRecord, InferenceEnsembler, ScoreEnsemble};
pub use error::{CascadeError, Result};
pub use head::{HeadOutput, RecordedHead, RecordedStage, RegressionMode, StageHead};
pub use matcher::{pairwise_iou, Assignment, IouMatcher};
pub use metrics::{mean_overlap, RegressionQuality};
pub use sampler::{SampledIndices, SamplingConfig, StageResampler};
pub use stage::{LossTargets, Origin, Proposal, StageOutput, StageTrainingOutput, TrainingSample};
