use std::collections::HashSet;

use anyhow::Result;
use url::Url;

use crate::extract::Extractor;

/// Pseudo-scheme used for references into the local cache.
pub const LOCAL_SCHEME: &str = "local://";

/// Navigation helper injected into rewritten pages and the generated index.
/// Intercepts clicks on local-scheme anchors so an embedding viewer can route
/// them through the cache instead of the network.
pub const NAV_SCRIPT: &str = "\
document.addEventListener('click', function (ev) {\n\
  var anchor = ev.target && ev.target.closest ? ev.target.closest('a') : null;\n\
  if (!anchor) { return; }\n\
  var href = anchor.getAttribute('href') || '';\n\
  if (href.indexOf('local://') === 0) {\n\
    ev.preventDefault();\n\
    window.location.href = './' + href.slice('local://'.length);\n\
  }\n\
});";

/// Rewrites remote references in HTML to local cache references.
///
/// Replacement is plain substring substitution over the raw markup, applied
/// once per distinct attribute value. A URL the resolver does not know stays
/// untouched, so a page with missing resources still renders and simply
/// points offsite for them. Rewriting is idempotent: local-scheme references
/// no longer match the extraction patterns.
pub struct Rewriter {
    base: Url,
    extractor: Extractor,
}

impl Rewriter {
    pub fn new(base: Url) -> Result<Self> {
        Ok(Self {
            base,
            extractor: Extractor::new()?,
        })
    }

    /// Replaces every recognized reference whose URL resolves to a cache key
    /// with a `local://<key>` reference.
    pub fn rewrite<F>(&self, html: &str, resolve: F) -> String
    where
        F: Fn(&Url) -> Option<String>,
    {
        let mut rewritten = html.to_string();
        let mut seen: HashSet<String> = HashSet::new();

        let mut candidates = self.extractor.discover_links(html, &self.base);
        candidates.extend(self.extractor.discover_leaves(html, &self.base));

        for resource in candidates {
            if !seen.insert(resource.raw.clone()) {
                continue;
            }
            if let Some(key) = resolve(&resource.url) {
                let local = format!("{}{}", LOCAL_SCHEME, key);
                // Replace only quoted attribute values so one URL that is a
                // prefix of another cannot be clobbered.
                rewritten = rewritten.replace(
                    &format!("\"{}\"", resource.raw),
                    &format!("\"{}\"", local),
                );
                rewritten = rewritten.replace(
                    &format!("'{}'", resource.raw),
                    &format!("'{}'", local),
                );
            }
        }

        rewritten
    }
}

/// Inserts a literal script block immediately before the closing body tag.
/// Returns the input unchanged when no closing body tag exists.
pub fn merge_script(html: &str, script_source: &str) -> String {
    match html.rfind("</body>") {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + script_source.len() + 24);
            out.push_str(&html[..idx]);
            out.push_str("<script>");
            out.push_str(script_source);
            out.push_str("</script>\n");
            out.push_str(&html[idx..]);
            out
        }
        None => html.to_string(),
    }
}
