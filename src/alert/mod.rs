mod alert_manager;

pub use alert_manager::{
    AlertEvent, AlertManager, AlertManagerConfig, AlertPort, AlertSeverity,
};
