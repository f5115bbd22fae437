pub mod publisher;
pub mod relay;
pub mod scale;
pub mod slot;

pub use publisher::{
    PreviewPublisher, PublishOutcome, PublisherHandle, PublisherStats, Subscription,
    SubscriptionId,
};
pub use relay::{CaptureLoop, LoopStats};
pub use scale::{fit_within, PreviewScaler};
pub use slot::{FrameSlot, SlotWrite};
