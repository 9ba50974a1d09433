//! VastAI instance management.
//!
//! `client` holds the REST client and the `VastApi` seam, `models` the
//! instance/offer records, `query` the offer search document.

pub mod client;
pub mod models;
pub mod query;

pub use client::{VastApi, VastClient};
pub use models::{CreateInstance, Instance, Offer, PortMapping};
pub use query::OfferQuery;
