//! vision_core: shared detector/display/overlay interfaces.

pub mod display;
pub mod interfaces;
pub mod overlay;

pub mod prelude {
    pub use crate::display::DisplayImage;
    pub use crate::interfaces::*;
    pub use crate::overlay::*;
}
