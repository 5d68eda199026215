use url::{Origin, Url};

/// Cookie jar scoped to the portal origin.
///
/// Holds `name=value` pairs in arrival order. A later `Set-Cookie` for the same
/// name replaces the earlier one. Nothing expires; the jar lives for one run.
#[derive(Debug, Clone)]
pub struct Session {
    portal_origin: Origin,
    cookies: Vec<(String, String)>,
}

impl Session {
    pub fn new(portal_url: &Url) -> Self {
        Self {
            portal_origin: portal_url.origin(),
            cookies: Vec::new(),
        }
    }

    pub fn apply_set_cookies<'a, I>(&mut self, values: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for value in values {
            let pair = value.split(';').next().unwrap_or("").trim();
            let Some((name, _)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            self.cookies.retain(|(existing, _)| existing != name);
            self.cookies.push((name.to_string(), pair.to_string()));
        }
    }

    /// `Cookie` header value for `url`, or `None` when the request leaves the portal.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        if self.cookies.is_empty() || url.origin() != self.portal_origin {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(_, pair)| pair.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}
