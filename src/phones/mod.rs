//! Authenticated phone-number lookups.

mod api;
mod batch;

pub use api::{parse_phone_response, HttpPhoneApi, PhoneApi, PhoneLookup, PHONE_API_BASE};
pub use batch::{
    BatchAuthFetcher, BatchConfig, BatchReport, ItemOutcome, PhoneEvent, DEFAULT_BATCH_SIZE,
    DEFAULT_MAX_REFRESHES_PER_BATCH, DEFAULT_PARALLELISM,
};
