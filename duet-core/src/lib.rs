pub mod assembler;
pub mod config;
pub mod correlator;
pub mod message;
pub mod normalizer;
pub mod persist;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod throttle;

pub use assembler::AssembleError;
pub use assembler::assemble;
pub use config::StreamConfig;
pub use config::StreamConfigError;
pub use config::WatchdogPolicy;
pub use config::resolve_stream_config;
pub use correlator::CorrelatorError;
pub use correlator::RunCorrelator;
pub use correlator::RunStep;
pub use message::ContentSegment;
pub use message::Message;
pub use message::SegmentKind;
pub use message::SegmentPatch;
pub use message::ToolArgs;
pub use message::ToolCall;
pub use message::ToolCallPatch;
pub use normalizer::NormalizeError;
pub use normalizer::normalize;
pub use persist::JsonlMessageSaver;
pub use persist::MemoryMessageSaver;
pub use persist::MessageSaver;
pub use persist::PersistError;
pub use protocol::Panel;
pub use protocol::RawEvent;
pub use protocol::StepKind;
pub use protocol::StreamEvent;
pub use recovery::AbortReason;
pub use recovery::RecoveryPayload;
pub use recovery::RunAbort;
pub use recovery::RunController;
pub use recovery::RunState;
pub use recovery::Submission;
pub use registry::ActivityEvent;
pub use registry::ClearReason;
pub use registry::RegistryTimings;
pub use registry::RunActivityEntry;
pub use registry::RunActivityRegistry;
pub use registry::RunKey;
pub use registry::SweeperHandle;
pub use session::MessageUpdate;
pub use session::StreamFault;
pub use session::TurnError;
pub use session::TurnOutput;
pub use session::TurnSession;
pub use throttle::Progress;
pub use throttle::ProgressThrottle;
