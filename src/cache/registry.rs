//! Query definition registry.
//!
//! Maps key shapes ([`KeyPattern`]) to the fetch function, staleness window,
//! retry policy, and pagination kind used to populate matching entries.
//! Definitions are grouped by domain (`"linodes"`, `"volumes"`, ...) and a
//! domain may delegate a sub-resource to another domain's definition.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing::debug;

use super::config::RetryPolicy;
use super::error::{QueryError, RegistryError};
use super::keys::{KeyPath, Segment};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";
const MAX_DELEGATION_DEPTH: usize = 8;

static FETCHER_IDS: AtomicU64 = AtomicU64::new(1);

pub type FetchFuture = BoxFuture<'static, Result<Value, QueryError>>;

/// Input of a fetch function.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchContext {
    /// Key being fetched, after any delegation rewrite.
    pub key: KeyPath,
    /// Page parameter for infinite queries.
    pub page_param: Option<Value>,
}

impl FetchContext {
    pub fn new(key: KeyPath) -> Self {
        Self {
            key,
            page_param: None,
        }
    }

    pub fn with_page_param(mut self, page_param: Option<Value>) -> Self {
        self.page_param = page_param;
        self
    }
}

/// A fetch function.
pub trait QueryFn: Send + Sync {
    fn fetch(&self, ctx: FetchContext) -> FetchFuture;
}

struct FnQuery<F>(F);

impl<F, Fut> QueryFn for FnQuery<F>
where
    F: Fn(FetchContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
{
    fn fetch(&self, ctx: FetchContext) -> FetchFuture {
        (self.0)(ctx).boxed()
    }
}

/// Shareable handle to a fetch function with a stable identity.
///
/// Two registrations use "the same fetch function" exactly when they hold
/// clones of the same `Fetcher`.
#[derive(Clone)]
pub struct Fetcher {
    id: u64,
    func: Arc<dyn QueryFn>,
}

impl Fetcher {
    pub fn new(func: impl QueryFn + 'static) -> Self {
        Self {
            id: FETCHER_IDS.fetch_add(1, Ordering::Relaxed),
            func: Arc::new(func),
        }
    }

    pub fn from_fn<F, Fut>(func: F) -> Self
    where
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
    {
        Self::new(FnQuery(func))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fetch(&self, ctx: FetchContext) -> FetchFuture {
        self.func.fetch(ctx)
    }

    pub fn same_as(&self, other: &Fetcher) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fetcher").field(&self.id).finish()
    }
}

/// How long fetched data stays fresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Staleness {
    /// Use the store's configured window.
    #[default]
    Default,
    After(Duration),
    /// Fresh until explicitly invalidated.
    Never,
}

impl Staleness {
    /// Reference data that rarely changes (regions, types, kernels).
    pub const LONG_LIVED: Self = Self::After(Duration::from_secs(10 * 60));

    pub fn window(self, default: Duration) -> Option<Duration> {
        match self {
            Self::Default => Some(default),
            Self::After(window) => Some(window),
            Self::Never => None,
        }
    }
}

/// Page-parameter strategy of an infinite query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// `page < pages` yields `page + 1`, starting at 1.
    PageNumber,
    /// The id of the last item on the previous page, starting without a cursor.
    LastId,
}

impl Pagination {
    pub fn initial_param(self) -> Option<Value> {
        match self {
            Self::PageNumber => Some(json!(1)),
            Self::LastId => None,
        }
    }

    /// Parameter for the page after `last_page`; `None` when there is none.
    pub fn next_param(self, last_page: &Value) -> Option<Value> {
        let page = last_page.get("page").and_then(Value::as_u64);
        let pages = last_page.get("pages").and_then(Value::as_u64);
        match self {
            Self::PageNumber => {
                let (page, pages) = (page?, pages?);
                (page < pages).then(|| json!(page + 1))
            }
            Self::LastId => {
                if pages.is_some_and(|pages| pages <= 1) {
                    return None;
                }
                last_page
                    .get("data")
                    .and_then(Value::as_array)
                    .and_then(|items| items.last())
                    .and_then(|item| item.get("id"))
                    .cloned()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryKind {
    #[default]
    Single,
    /// One entry holds `{pages, page_params}`.
    Infinite(Pagination),
}

/// Everything needed to populate keys of one shape.
#[derive(Debug, Clone)]
pub struct QueryDefinition {
    pub domain: &'static str,
    pub pattern: KeyPattern,
    pub fetcher: Fetcher,
    pub staleness: Staleness,
    /// `None` uses the store's configured policy.
    pub retry: Option<RetryPolicy>,
    pub kind: QueryKind,
}

impl QueryDefinition {
    pub fn new(domain: &'static str, pattern: KeyPattern, fetcher: Fetcher) -> Self {
        Self {
            domain,
            pattern,
            fetcher,
            staleness: Staleness::Default,
            retry: None,
            kind: QueryKind::Single,
        }
    }

    pub fn staleness(mut self, staleness: Staleness) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn infinite(mut self, pagination: Pagination) -> Self {
        self.kind = QueryKind::Infinite(pagination);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SegmentMatcher {
    Exact(Segment),
    AnyParams(Arc<str>),
}

impl SegmentMatcher {
    fn name(&self) -> &str {
        match self {
            Self::Exact(segment) => segment.name(),
            Self::AnyParams(name) => name,
        }
    }

    fn matches(&self, segment: &Segment) -> bool {
        match self {
            Self::Exact(expected) => expected == segment,
            Self::AnyParams(name) => segment.name() == &**name,
        }
    }

    /// Some segment satisfies both matchers.
    fn compatible(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Exact(segment), Self::AnyParams(name))
            | (Self::AnyParams(name), Self::Exact(segment)) => segment.name() == &**name,
            (Self::AnyParams(a), Self::AnyParams(b)) => a == b,
        }
    }
}

/// Shape of the keys a definition serves.
///
/// An exact-length pattern matches keys with exactly its segments; a subtree
/// pattern also matches every key extending them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyPattern {
    matchers: Vec<SegmentMatcher>,
    subtree: bool,
}

impl KeyPattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every segment of `key`, matched exactly.
    pub fn from_key(key: &KeyPath) -> Self {
        Self {
            matchers: key.segments().iter().cloned().map(SegmentMatcher::Exact).collect(),
            subtree: false,
        }
    }

    /// A bare segment called `name`.
    pub fn exact(self, name: &str) -> Self {
        self.segment(Segment::named(name))
    }

    pub fn segment(mut self, segment: Segment) -> Self {
        self.matchers.push(SegmentMatcher::Exact(segment));
        self
    }

    /// A segment called `name` with any (or no) parameters.
    pub fn any(mut self, name: &str) -> Self {
        self.matchers.push(SegmentMatcher::AnyParams(Arc::from(name)));
        self
    }

    pub fn subtree(mut self) -> Self {
        self.subtree = true;
        self
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn is_subtree(&self) -> bool {
        self.subtree
    }

    pub fn matches(&self, key: &KeyPath) -> bool {
        let segments = key.segments();
        let length_ok = if self.subtree {
            segments.len() >= self.matchers.len()
        } else {
            segments.len() == self.matchers.len()
        };
        length_ok
            && self
                .matchers
                .iter()
                .zip(segments)
                .all(|(matcher, segment)| matcher.matches(segment))
    }

    /// Some concrete key matches both patterns.
    pub fn overlaps(&self, other: &KeyPattern) -> bool {
        let shared_ok = self
            .matchers
            .iter()
            .zip(&other.matchers)
            .all(|(a, b)| a.compatible(b));
        shared_ok
            && match self.len().cmp(&other.len()) {
                std::cmp::Ordering::Equal => true,
                std::cmp::Ordering::Less => self.subtree,
                std::cmp::Ordering::Greater => other.subtree,
            }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, matcher) in self.matchers.iter().enumerate() {
            if index > 0 {
                f.write_str(".")?;
            }
            match matcher {
                SegmentMatcher::Exact(segment) => write!(f, "{segment}")?,
                SegmentMatcher::AnyParams(_) => write!(f, "{}{{*}}", matcher.name())?,
            }
        }
        if self.subtree {
            f.write_str(".**")?;
        }
        Ok(())
    }
}

/// Rewrites a key before it is resolved against a delegation target.
pub type KeyMap = Arc<dyn Fn(&KeyPath) -> KeyPath + Send + Sync>;

enum Target {
    Fetch(Arc<QueryDefinition>),
    Delegate { target: KeyPattern, map: KeyMap },
}

struct Registration {
    domain: &'static str,
    pattern: KeyPattern,
    target: Target,
}

impl Registration {
    /// Exact-length registrations win over subtrees, longer over shorter.
    fn specificity(&self) -> (bool, usize) {
        (!self.pattern.is_subtree(), self.pattern.len())
    }
}

/// Result of [`QueryRegistry::resolve`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub definition: Arc<QueryDefinition>,
    /// Key handed to the fetch function.
    pub fetch_key: KeyPath,
}

/// The registry of query definitions.
#[derive(Default)]
pub struct QueryRegistry {
    registrations: RwLock<Vec<Registration>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition.
    ///
    /// Rejected when its pattern overlaps a registration served by a
    /// different fetcher. A subtree pattern overlaps all its descendants, so
    /// a definition cannot claim the ancestor scope of another fetcher's keys.
    pub fn register(&self, definition: QueryDefinition) -> Result<(), RegistryError> {
        let mut registrations = rw_write(&self.registrations, SOURCE, "register");
        ensure_compatible(&registrations, &definition.pattern, &definition.fetcher)?;

        debug!(
            domain = definition.domain,
            pattern = %definition.pattern,
            fetcher = definition.fetcher.id(),
            "Query definition registered"
        );

        let registration = Registration {
            domain: definition.domain,
            pattern: definition.pattern.clone(),
            target: Target::Fetch(Arc::new(definition)),
        };
        match registrations
            .iter_mut()
            .find(|existing| existing.pattern == registration.pattern)
        {
            Some(existing) => *existing = registration,
            None => registrations.push(registration),
        }
        Ok(())
    }

    /// Shorthand for [`register`](Self::register) with default retry and kind.
    pub fn register_fn(
        &self,
        domain: &'static str,
        pattern: KeyPattern,
        fetcher: Fetcher,
        staleness: Staleness,
    ) -> Result<(), RegistryError> {
        self.register(QueryDefinition::new(domain, pattern, fetcher).staleness(staleness))
    }

    /// Serve keys matching `pattern` with the definition registered at
    /// `target`, after rewriting each key with `map`.
    pub fn delegate(
        &self,
        domain: &'static str,
        pattern: KeyPattern,
        target: KeyPattern,
        map: impl Fn(&KeyPath) -> KeyPath + Send + Sync + 'static,
    ) -> Result<(), RegistryError> {
        let mut registrations = rw_write(&self.registrations, SOURCE, "delegate");
        let fetcher = chain_fetcher(&registrations, &target, Some(&pattern))?;
        ensure_compatible(&registrations, &pattern, &fetcher)?;

        debug!(domain, pattern = %pattern, target = %target, "Query delegation registered");

        registrations.push(Registration {
            domain,
            pattern,
            target: Target::Delegate {
                target,
                map: Arc::new(map),
            },
        });
        Ok(())
    }

    /// Find the definition serving `key`.
    pub fn resolve(&self, key: &KeyPath) -> Result<Resolved, RegistryError> {
        let registrations = rw_read(&self.registrations, SOURCE, "resolve");
        let mut fetch_key = key.clone();

        for _ in 0..MAX_DELEGATION_DEPTH {
            let registration = registrations
                .iter()
                .filter(|registration| registration.pattern.matches(&fetch_key))
                .max_by_key(|registration| registration.specificity())
                .ok_or_else(|| RegistryError::Unresolved {
                    key: fetch_key.to_string(),
                })?;

            match &registration.target {
                Target::Fetch(definition) => {
                    return Ok(Resolved {
                        definition: Arc::clone(definition),
                        fetch_key,
                    });
                }
                Target::Delegate { map, .. } => fetch_key = map(&fetch_key),
            }
        }

        Err(RegistryError::Cycle {
            pattern: key.to_string(),
        })
    }

    /// Registered domains, deduplicated, in registration order.
    pub fn domains(&self) -> Vec<&'static str> {
        let registrations = rw_read(&self.registrations, SOURCE, "domains");
        let mut domains: Vec<&'static str> = Vec::new();
        for registration in registrations.iter() {
            if !domains.contains(&registration.domain) {
                domains.push(registration.domain);
            }
        }
        domains
    }

    pub fn len(&self) -> usize {
        rw_read(&self.registrations, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Follow delegations from `start` to the fetcher that finally serves it.
fn chain_fetcher(
    registrations: &[Registration],
    start: &KeyPattern,
    forbidden: Option<&KeyPattern>,
) -> Result<Fetcher, RegistryError> {
    let mut current = start;
    for _ in 0..MAX_DELEGATION_DEPTH {
        if forbidden.is_some_and(|pattern| pattern == current) {
            return Err(RegistryError::Cycle {
                pattern: current.to_string(),
            });
        }
        let registration = registrations
            .iter()
            .find(|registration| &registration.pattern == current)
            .ok_or_else(|| RegistryError::MissingTarget {
                target: current.to_string(),
            })?;
        match &registration.target {
            Target::Fetch(definition) => return Ok(definition.fetcher.clone()),
            Target::Delegate { target, .. } => current = target,
        }
    }
    Err(RegistryError::Cycle {
        pattern: start.to_string(),
    })
}

fn ensure_compatible(
    registrations: &[Registration],
    pattern: &KeyPattern,
    fetcher: &Fetcher,
) -> Result<(), RegistryError> {
    for existing in registrations {
        if !existing.pattern.overlaps(pattern) {
            continue;
        }
        let existing_fetcher = chain_fetcher(registrations, &existing.pattern, None)?;
        if !existing_fetcher.same_as(fetcher) {
            return Err(RegistryError::Conflict {
                pattern: pattern.to_string(),
                existing: existing.pattern.to_string(),
            });
        }
    }
    Ok(())
}
