//! The fixed-size database page record.

use luxdb_error::{LuxdbError, Result};

/// The size of a database page in bytes.
pub const PAGE_BYTES: usize = 4096;

/// A single database page image and its page number.
///
/// Page numbers start at 1; page 0 does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    index: i64,
    data: Vec<u8>,
}

impl Page {
    /// Creates a zero-filled page with the given page number.
    pub fn new(index: i64) -> Result<Self> {
        Self::with_data(index, vec![0; PAGE_BYTES])
    }

    /// Creates a page with the given page number and contents.
    ///
    /// Fails if `index < 1` or `data` is not exactly [`PAGE_BYTES`] long.
    pub fn with_data(index: i64, data: Vec<u8>) -> Result<Self> {
        if index < 1 {
            return Err(LuxdbError::OutOfRange {
                what: "page index",
                value: index,
            });
        }
        if data.len() != PAGE_BYTES {
            return Err(LuxdbError::OutOfRange {
                what: "page data length",
                value: i64::try_from(data.len()).unwrap_or(i64::MAX),
            });
        }
        Ok(Self { index, data })
    }

    /// The page number in the database.
    #[must_use]
    pub fn index(&self) -> i64 {
        self.index
    }

    /// The page contents.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The page contents, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_is_zeroed() {
        let page = Page::new(1).expect("page");
        assert_eq!(page.index(), 1);
        assert_eq!(page.data().len(), PAGE_BYTES);
        assert!(page.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn page_numbers_start_at_one() {
        assert!(matches!(
            Page::new(0),
            Err(LuxdbError::OutOfRange { value: 0, .. })
        ));
        assert!(matches!(
            Page::new(-3),
            Err(LuxdbError::OutOfRange { value: -3, .. })
        ));
    }

    #[test]
    fn with_data_validates_length() {
        let err = Page::with_data(1, vec![0; 100]).expect_err("short page must fail");
        assert!(matches!(err, LuxdbError::OutOfRange { value: 100, .. }));
    }
}
