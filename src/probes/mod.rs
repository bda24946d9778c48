//! Concrete probes, one per pipeline phase.

pub mod check;
pub mod execute;
pub mod session;
pub mod smoke;
pub mod ui;
pub mod visual;

pub use check::StaticCheckProbe;
pub use execute::ExecutionProbe;
pub use session::SessionQueryProbe;
pub use smoke::SmokeProbe;
pub use ui::UiVerifier;
pub use visual::VisualValidator;
