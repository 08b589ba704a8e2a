//! Backend routes and the canonical cache slot for each read.
//!
//! Reads built here are shared by the façade helpers, cache warming and
//! prefetch, so a warmed entry is exactly the one a later read looks up.

use serde_json::{json, Value};

use crate::cache::CacheType;

use super::request::{CacheConfig, HttpRequest};

const BOOKS: &str = "/books";
const READING_SESSIONS: &str = "/reading-sessions";
const NOTES: &str = "/notes";
const STATS: &str = "/stats";
const COVERS: &str = "/covers";

/// Default number of sessions in the "recent sessions" list.
pub const RECENT_SESSIONS_LIMIT: usize = 10;

pub fn books(user_id: &str, filters: &Value) -> (HttpRequest, CacheConfig) {
    let filters = if filters.is_null() { json!({}) } else { filters.clone() };
    (
        HttpRequest::get(BOOKS).with_params(filters.clone()),
        CacheConfig::query(CacheType::Books, &filters, Some(user_id)),
    )
}

pub fn book(user_id: &str, book_id: &str) -> (HttpRequest, CacheConfig) {
    (
        HttpRequest::get(format!("{}/{}", BOOKS, book_id)),
        CacheConfig::cached(CacheType::Books, book_id, Some(user_id)),
    )
}

pub fn create_book(user_id: &str, book: Value) -> (HttpRequest, CacheConfig) {
    (
        HttpRequest::post(BOOKS, book),
        CacheConfig::invalidating(CacheType::Books.as_str(), Some(user_id)),
    )
}

pub fn update_book(user_id: &str, book_id: &str, updates: Value) -> (HttpRequest, CacheConfig) {
    (
        HttpRequest::patch(format!("{}/{}", BOOKS, book_id), updates),
        CacheConfig::invalidating(CacheType::Books.as_str(), Some(user_id)),
    )
}

pub fn delete_book(user_id: &str, book_id: &str) -> (HttpRequest, CacheConfig) {
    (
        HttpRequest::delete(format!("{}/{}", BOOKS, book_id)),
        CacheConfig::invalidating(CacheType::Books.as_str(), Some(user_id)),
    )
}

pub fn reading_sessions(user_id: &str, limit: usize) -> (HttpRequest, CacheConfig) {
    (
        HttpRequest::get(READING_SESSIONS).with_params(json!({ "limit": limit })),
        CacheConfig::cached(CacheType::Sessions, format!("recent_{}", limit), Some(user_id)),
    )
}

pub fn create_reading_session(user_id: &str, session: Value) -> (HttpRequest, CacheConfig) {
    (
        HttpRequest::post(READING_SESSIONS, session),
        CacheConfig::invalidating(CacheType::Sessions.as_str(), Some(user_id)),
    )
}

pub fn notes(user_id: &str, book_id: Option<&str>) -> (HttpRequest, CacheConfig) {
    match book_id {
        Some(id) => (
            HttpRequest::get(NOTES).with_params(json!({ "bookId": id })),
            CacheConfig::cached(CacheType::Notes, format!("book_{}", id), Some(user_id)),
        ),
        None => (
            HttpRequest::get(NOTES),
            CacheConfig::cached(CacheType::Notes, "all", Some(user_id)),
        ),
    }
}

pub fn create_note(user_id: &str, note: Value) -> (HttpRequest, CacheConfig) {
    (
        HttpRequest::post(NOTES, note),
        CacheConfig::invalidating(CacheType::Notes.as_str(), Some(user_id)),
    )
}

pub fn stats(user_id: &str) -> (HttpRequest, CacheConfig) {
    (
        HttpRequest::get(STATS),
        CacheConfig::cached(CacheType::Stats, "summary", Some(user_id)),
    )
}

/// Covers are shared between users.
pub fn cover(book_id: &str) -> (HttpRequest, CacheConfig) {
    (
        HttpRequest::get(format!("{}/{}", COVERS, book_id)),
        CacheConfig::cached(CacheType::Covers, book_id, None),
    )
}

/// Default payload fetched when warming `cache_type`, if it has one.
pub fn warm_target(cache_type: CacheType, user_id: &str) -> Option<(HttpRequest, CacheConfig)> {
    match cache_type {
        CacheType::Books => Some(books(user_id, &json!({}))),
        CacheType::Sessions => Some(reading_sessions(user_id, RECENT_SESSIONS_LIMIT)),
        CacheType::Notes => Some(notes(user_id, None)),
        CacheType::Stats => Some(stats(user_id)),
        CacheType::Covers | CacheType::Files => None,
    }
}
