pub mod model;
pub mod wire;

pub use model::{
    Device, DeviceCategory, DeviceMode, MetricKind, Notification, NotificationPage,
    PaginationInfo, PaginationMeta, SensorReading, SwitchState, ThresholdDirection, Thresholds,
    UserProfile,
};
pub use wire::{ChannelFrame, ClientCommand, FrameError};
