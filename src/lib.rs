//! Pull generated images and videos from remote Stable Diffusion Forge and
//! ComfyUI hosts, including rented VastAI GPU instances, into a local media
//! library.
//!
//! ## Module Map
//!
//! | Module    | Responsibility                                             |
//! |-----------|------------------------------------------------------------|
//! | `config`  | `media-sync.toml` model and env/CLI override layering      |
//! | `errors`  | Typed errors per subsystem                                 |
//! | `history` | SQLite run history behind an async `DbHandle`              |
//! | `logging` | `tracing` subscriber setup                                 |
//! | `media`   | Inventory of media already pulled                          |
//! | `ssh`     | Endpoints, remote commands, `UI_HOME`, key bootstrapping   |
//! | `sync`    | rsync runner, progress files, per-target locking           |
//! | `vast`    | VastAI REST client and offer queries                       |
//! | `web`     | JSON HTTP API and event WebSocket                          |

pub mod config;
pub mod errors;
pub mod history;
pub mod logging;
pub mod media;
pub mod ssh;
pub mod sync;
pub mod util;
pub mod vast;
pub mod web;
