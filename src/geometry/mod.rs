//! Camera geometry shared by the detection, marker and render paths.

pub mod homography;
pub mod intrinsics;
pub mod pose;

pub use intrinsics::Intrinsics;
pub use pose::{planar_marker_pose, rigid_align, yaw_pitch_roll, RigidPose};
