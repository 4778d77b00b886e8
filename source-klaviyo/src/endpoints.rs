//! The closed set of Klaviyo REST endpoints this connector calls, each with
//! its `{burst, steady, scopes}` triple (§6).

use source_base::ratelimit::EndpointBudget;

/// One row of the static endpoint budget table.
pub struct EndpointSpec {
    pub key: &'static str,
    pub budget: EndpointBudget,
    pub scopes: &'static [&'static str],
}

/// The full endpoint table, built once at process startup and handed to
/// [`source_base::ratelimit::RateLimiterRegistry::new`].
pub const ENDPOINTS: &[EndpointSpec] = &[
    EndpointSpec {
        key: "GET:/events/",
        budget: EndpointBudget::new(350, 3500),
        scopes: &["events:read"],
    },
    EndpointSpec {
        key: "GET:/profiles/",
        budget: EndpointBudget::new(350, 3500),
        scopes: &["profiles:read"],
    },
    EndpointSpec {
        key: "GET:/campaigns/",
        budget: EndpointBudget::new(10, 150),
        scopes: &["campaigns:read"],
    },
    EndpointSpec {
        key: "GET:/campaign-messages/",
        budget: EndpointBudget::new(10, 150),
        scopes: &["campaigns:read"],
    },
    EndpointSpec {
        key: "GET:/tags/",
        budget: EndpointBudget::new(10, 150),
        scopes: &["tags:read"],
    },
    EndpointSpec {
        key: "GET:/flows/",
        budget: EndpointBudget::new(10, 150),
        scopes: &["flows:read"],
    },
    EndpointSpec {
        key: "GET:/flow-actions/",
        budget: EndpointBudget::new(10, 150),
        scopes: &["flows:read"],
    },
    EndpointSpec {
        key: "GET:/flow-messages/",
        budget: EndpointBudget::new(10, 150),
        scopes: &["flows:read"],
    },
    EndpointSpec {
        key: "GET:/templates/",
        budget: EndpointBudget::new(75, 700),
        scopes: &["templates:read"],
    },
    EndpointSpec {
        key: "GET:/metrics/",
        budget: EndpointBudget::new(10, 150),
        scopes: &["metrics:read"],
    },
    EndpointSpec {
        key: "POST:/oauth/token",
        budget: EndpointBudget::new(1, 60),
        scopes: &[],
    },
];

pub fn table() -> impl IntoIterator<Item = (&'static str, EndpointBudget)> {
    ENDPOINTS.iter().map(|e| (e.key, e.budget))
}
