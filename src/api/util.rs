use super::*;

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;
/// Keeps `offset` and leaderboard ranks within `i64`.
pub const MAX_PAGE: i64 = i64::MAX / MAX_LIMIT;

impl PageQuery {
    /// Falls back to the defaults for missing or non-positive values and caps the limit.
    pub fn resolve(&self) -> Pagination {
        let page = match self.page {
            Some(page) if page > 0 => page.min(MAX_PAGE),
            _ => DEFAULT_PAGE,
        };
        let limit = match self.limit {
            Some(limit) if limit > 0 => limit.min(MAX_LIMIT),
            _ => DEFAULT_LIMIT,
        };
        Pagination { page, limit }
    }
}
impl Pagination {
    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }
    pub fn meta(&self, total: i64) -> PageMeta {
        PageMeta {
            total,
            page: self.page,
            limit: self.limit,
            pages: total.saturating_add(self.limit - 1) / self.limit,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pagination_defaults() {
        let pagination = PageQuery::default().resolve();
        assert_eq!(pagination, Pagination { page: 1, limit: 10 });
        assert_eq!(pagination.offset(), 0);

        let pagination = PageQuery {
            page: Some(-3),
            limit: Some(0),
        }
        .resolve();
        assert_eq!(pagination, Pagination { page: 1, limit: 10 });
    }

    #[test]
    fn pagination_caps_limit() {
        let pagination = PageQuery {
            page: Some(3),
            limit: Some(500),
        }
        .resolve();
        assert_eq!(pagination, Pagination { page: 3, limit: 100 });
        assert_eq!(pagination.offset(), 200);
    }

    #[test]
    fn pagination_huge_page() {
        let pagination = PageQuery {
            page: Some(i64::MAX),
            limit: Some(10),
        }
        .resolve();
        assert_eq!(pagination.page, MAX_PAGE);
        assert_eq!(pagination.offset(), (MAX_PAGE - 1) * 10);
        assert!(pagination.offset() > 0);

        let pagination = PageQuery {
            page: Some(i64::MAX),
            limit: Some(i64::MAX),
        }
        .resolve();
        assert_eq!(pagination.offset(), (MAX_PAGE - 1) * MAX_LIMIT);
        // built by hand, past what `resolve` allows
        let unchecked = Pagination {
            page: i64::MAX,
            limit: i64::MAX,
        };
        assert_eq!(unchecked.offset(), i64::MAX);
    }

    #[test]
    fn page_meta_rounds_up() {
        let pagination = Pagination { page: 1, limit: 10 };
        assert_eq!(pagination.meta(0).pages, 0);
        assert_eq!(pagination.meta(10).pages, 1);
        assert_eq!(pagination.meta(11).pages, 2);
    }
}
