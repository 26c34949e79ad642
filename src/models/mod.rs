pub mod cursor;
pub mod event;
pub mod frame;
pub mod ocr;
pub mod retention;
pub mod scene;
pub mod segment;

pub use cursor::{CursorEvent, CursorKind};
pub use event::{EventRecord, EventType};
pub use frame::{FrameId, FrameRecord, OcrStatus, SampledFrame};
pub use ocr::{OcrFieldInput, OcrRecord, RegionGeometry, RegionId};
pub use retention::{DataClass, RetentionPolicy, SweepOutcome};
pub use scene::{ChangeType, SceneChange, SceneSignals};
pub use segment::{SegmentDescriptor, SegmentState, WindowContext};
