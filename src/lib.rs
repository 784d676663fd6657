//! vr_warp - HMD distortion and timewarp runtime
//!
//! Takes an application-rendered stereo pair and puts a lens-corrected,
//! late-reprojected image on the headset panel. The pieces, leaf first:
//! pose prediction (`pose_source`, `eye_pose`), frame timing (`timing`),
//! lens and mesh generation (`lens`, `mesh`), timewarp (`timewarp`), swap
//! texture rings (`swap_chain`) and the wgpu warp pass (`renderer`), tied
//! together by a `session::Session`.

pub mod config;
pub mod display;
pub mod error;
pub mod eye_pose;
pub mod hmd;
pub mod layer;
pub mod lens;
pub mod mesh;
pub mod pose_source;
pub mod renderer;
pub mod session;
pub mod swap_chain;
pub mod timewarp;
pub mod timing;
pub mod types;

pub use config::RuntimeConfig;
pub use error::{VrError, VrResult};
pub use hmd::{DistortionCaps, HmdDesc, HmdType};
pub use layer::Layer;
pub use renderer::SubmitStatus;
pub use session::{HmdHandle, Session, SessionTable};
