//! Crawler module: the coordinator, the workers and their supervision
//!
//! This module contains the crawl pipeline, including:
//! - Page fetching through rotating proxies
//! - Publication extraction from author pages
//! - Task generation, result handling and retries
//! - Running and stopping every unit of the pipeline

mod coordinator;
mod fetcher;
mod parser;
mod supervisor;
mod worker;

pub use coordinator::Coordinator;
pub use fetcher::{
    build_http_client, classify_status, random_user_agent, FetchedPage, HttpFetcher, PageFetcher,
    USER_AGENTS,
};
pub use parser::{
    parse_publications, parse_with, selectors_for, SelectorSet, DBLP_SELECTORS,
    GOOGLE_SCHOLAR_SELECTORS,
};
pub use supervisor::{connect_with_retry, Shutdown, StoreFactory, Supervisor};
pub use worker::Worker;
