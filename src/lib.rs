//! Relays new items from mirrored RSS feeds to per-account webhooks.
//!
//! Each cycle resolves a working mirror per account, extracts the recent item
//! window, detects what is newer than the stored watermark and delivers it
//! oldest-first, persisting the watermark after every delivered item.
//!
//! ```text
//! resolver → parser/normalize → detector → delivery → state
//! ```

pub mod config;
pub mod feed;
pub mod relay;
pub mod storage;
