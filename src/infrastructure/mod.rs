//! 基础设施层
//!
//! 持有稀缺资源（HTTP 会话、Cookie 文件），只暴露能力

pub mod cookie_store;
pub mod parser;
pub mod session;

pub use cookie_store::{CookieStore, FileCookieStore, MemoryCookieStore};
pub use parser::{MarkerPageParser, PageKind, PageParser};
pub use session::{CookieJar, LoginState, Session};
