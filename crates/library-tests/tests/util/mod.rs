use std::time::Duration;

use eyre::Result;
use library_tests::Api;
use serde_json::json;

/// Upper bound for the batch worker to settle a reservation
#[allow(unused)]
pub const SETTLE: Duration = Duration::from_secs(5);

/// Add a book with `copies` copies and check the catalog reports it.
#[allow(unused)]
pub fn add_book(api: &Api, isbn: &str, copies: u32) -> Result<()> {
    api.post(
        "/books",
        &json!({
            "isbn": isbn,
            "title": format!("Test Book {isbn}"),
            "author": "Test Author",
            "category": "Testing",
            "total_copies": copies,
        }),
    )?
    .expect_status(200)?;
    let book = api.book(isbn)?;
    assert_eq!(
        book["available_copies"], copies,
        "A freshly added book must have all of its copies available."
    );
    Ok(())
}
