//! Provider adapters implementing [`DataSource`](crate::DataSource).
//!
//! | Adapter | Upstream | Wire format |
//! |---------|----------|-------------|
//! | [`SseAdapter`] | Shanghai Stock Exchange quote feed | JSONP, positional rows |
//! | [`SzseAdapter`] | Shenzhen Stock Exchange report API | paged JSON, formatted strings |
//! | [`EastmoneyAdapter`] | Eastmoney list API | JSONP, numbered fields |

mod common;
pub mod eastmoney;
pub mod sse;
pub mod szse;

pub use eastmoney::EastmoneyAdapter;
pub use sse::SseAdapter;
pub use szse::SzseAdapter;
