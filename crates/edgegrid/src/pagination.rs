use crate::{Client, Error, Request};

/// PageQuery is an offset/limit window over a list endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub offset: usize,
    pub limit: usize,
}

impl PageQuery {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    /// The window following this one, given how many items it returned.
    /// Returns None when the page came back short, i.e. the listing is done.
    pub fn advance(&self, returned: usize) -> Option<Self> {
        if returned < self.limit {
            None
        } else {
            Some(Self {
                offset: self.offset + returned,
                limit: self.limit,
            })
        }
    }

    pub fn apply(&self, req: Request) -> Request {
        req.query("offset", self.offset.to_string())
            .query("limit", self.limit.to_string())
    }
}

/// Parse the `rel="next"` target of an RFC 5988 `Link` header, as used by
/// endpoints which paginate by link rather than offset.
pub fn next_link(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let value = headers.get(reqwest::header::LINK)?.to_str().ok()?;

    for part in value.split(',') {
        let mut pieces = part.trim().split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        if is_next && target.starts_with('<') && target.ends_with('>') {
            return Some(target[1..target.len() - 1].to_string());
        }
    }
    None
}

impl Client {
    /// Drain an offset/limit-paginated listing, collecting the array found
    /// under `items_key` of each response document.
    pub async fn get_all_pages(
        &self,
        path: &str,
        items_key: &str,
        page_size: usize,
    ) -> Result<Vec<serde_json::Value>, Error> {
        let mut items = Vec::new();
        let mut page = PageQuery::first(page_size);

        loop {
            let document: serde_json::Value =
                self.send_json(page.apply(Request::get(path))).await?;

            let mut returned = match document.get(items_key) {
                Some(serde_json::Value::Array(values)) => values.clone(),
                _ => Vec::new(),
            };
            let count = returned.len();
            items.append(&mut returned);

            match page.advance(count) {
                Some(next) => page = next,
                None => return Ok(items),
            }
        }
    }
}
