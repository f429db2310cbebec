//! Page arithmetic and `Link` headers for collection responses.

use axum::http::{HeaderValue, Uri};
use std::collections::HashMap;

/// Requested page and page size, after defaults and caps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u64,
    pub results_per_page: u64,
}

impl PageRequest {
    /// `results_per_page` falls back to `default` unless it is a positive integer,
    /// and is capped at `max`. `page` defaults to 1.
    pub fn from_query(query: &HashMap<String, String>, default: u64, max: u64) -> Self {
        let requested = query
            .get("results_per_page")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|n| *n > 0)
            .map(|n| n as u64)
            .unwrap_or(default);
        let page = query
            .get("page")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1);
        PageRequest {
            page,
            results_per_page: requested.min(max).max(1),
        }
    }

    /// Offset of the first row of this page.
    pub fn start(&self) -> u64 {
        (self.page - 1).saturating_mul(self.results_per_page)
    }

    pub fn total_pages(&self, num_results: u64) -> u64 {
        num_results.div_ceil(self.results_per_page)
    }
}

fn page_url(uri: &Uri, page: u64, results_per_page: u64) -> String {
    let mut pairs: Vec<&str> = uri
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty() && !p.starts_with("page=") && !p.starts_with("results_per_page="))
        .collect();
    let page = format!("page={}", page);
    let size = format!("results_per_page={}", results_per_page);
    pairs.push(&page);
    pairs.push(&size);
    format!("{}?{}", uri.path(), pairs.join("&"))
}

/// `next` (unless on the last page) and `last` links.
pub fn link_header(uri: &Uri, request: PageRequest, total_pages: u64) -> Option<HeaderValue> {
    let last = total_pages.max(1);
    let mut links = Vec::new();
    if request.page < last {
        links.push(format!("<{}>; rel=\"next\"", page_url(uri, request.page + 1, request.results_per_page)));
    }
    links.push(format!("<{}>; rel=\"last\"", page_url(uri, last, request.results_per_page)));
    HeaderValue::from_str(&links.join(", ")).ok()
}
