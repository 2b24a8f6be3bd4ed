pub mod classifier;
pub mod config;
pub mod frame_extractor;
pub mod handler;
pub mod predictor;
pub mod processor;
pub mod registry;

pub use classifier::{Classifier, InputTensor, ModelBackend, TractBackend};
pub use config::{ConfigLayer, ConfigLoader, ModelSpec, NormalRule, ServiceConfig};
pub use frame_extractor::{split_video_to_frames, ExtractOptions, FrameExtractor};
pub use handler::{router, AppState};
pub use predictor::{predict_on_image, ErrorBody, PredictError, PredictionOutcome, PredictionResult};
pub use processor::{analyze_images, analyze_video, VideoAnalysis, VideoSummary};
pub use registry::{LoadError, ModelEntry, ModelRegistry};
