pub mod cache_refill;
pub mod captcha_cache;
pub mod session_pool;
pub mod solvers;
pub mod target_filter;

pub use cache_refill::{CacheRefiller, CaptchaProvider, SessionCaptchaProvider};
pub use captcha_cache::{CacheEvent, CaptchaCache};
pub use session_pool::{BrowserImport, LoginOptions, SessionLease, SessionLogin, SessionPool};
pub use solvers::{build_solver, CaptchaSolver};
pub use target_filter::TargetFilter;
