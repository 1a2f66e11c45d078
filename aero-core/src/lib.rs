//! AeroSync protocol core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chunk;
pub mod core;
pub mod identity;
pub mod integrity;
pub mod liveness;
pub mod peers;
pub mod protocol;
pub mod throughput;
pub mod transfer;
pub mod trust;
pub mod wire;

pub use crate::core::{Action, Coordinator, CoordinatorConfig, Event};
pub use chunk::ChunkSizer;
pub use identity::{DeviceId, Keypair, PublicKey, SessionKeys, VerificationCode};
pub use liveness::{LivenessConfig, LivenessState};
pub use peers::{Peer, PeerAdvertisement, TrustState};
pub use protocol::{DeviceClass, FileMeta, Hello, Message, PROTOCOL_VERSION};
pub use throughput::ThroughputMeter;
pub use transfer::{Direction, FailureReason, FileDescriptor, JobError, JobId, JobState, TransferJob};
pub use trust::{AuthMode, TrustCheck, TrustStore, TrustedPeer};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
