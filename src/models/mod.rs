pub mod captcha;
pub mod page;
pub mod target;

pub use captcha::{Captcha, CaptchaKind, EXPIRATION_AGE};
pub use page::{ActionOutcome, ActionPage, CaptchaPage, LoginStatus, RosterPage, TypedPage};
pub use target::{DispatchResult, Target};
