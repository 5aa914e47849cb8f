use tessera_api_types::ResourcePage;

use crate::cache::{EntityType, InvalidationReport, KeyPath, PageRequest, QueryError};
use crate::client::{QueryClient, QueryObserver};

use super::paginated::PaginatedView;

/// Paginated list of `child` scoped to one parent entity, keyed
/// `<parent>.detail{id=N}.<child>.paginated{..}`.
///
/// Lives under the parent's detail key, so removing or invalidating the
/// parent reaches it too.
#[derive(Debug, Clone)]
pub struct ScopedView {
    parent: EntityType,
    parent_id: u64,
    pages: PaginatedView,
}

impl ScopedView {
    /// `child` is a sub-resource name such as `"configs"` or an entity
    /// namespace such as `"volumes"`.
    pub fn new(
        client: &QueryClient,
        parent: EntityType,
        parent_id: u64,
        child: &str,
        request: PageRequest,
    ) -> Self {
        Self {
            parent,
            parent_id,
            pages: PaginatedView::under(client, parent.detail_key(parent_id).child(child), request),
        }
    }

    /// Lists of entity `child` owned by the parent.
    pub fn of_entity(
        client: &QueryClient,
        parent: EntityType,
        parent_id: u64,
        child: EntityType,
        request: PageRequest,
    ) -> Self {
        Self::new(client, parent, parent_id, child.namespace(), request)
    }

    pub fn parent(&self) -> (EntityType, u64) {
        (self.parent, self.parent_id)
    }

    pub fn key(&self) -> KeyPath {
        self.pages.key()
    }

    /// Prefix shared by every page of this scoped list.
    pub fn scope(&self) -> KeyPath {
        self.key().parent().unwrap_or_else(|| self.parent.detail_key(self.parent_id))
    }

    pub async fn fetch(&self) -> Result<ResourcePage, QueryError> {
        self.pages.fetch().await
    }

    pub fn cached(&self) -> Option<ResourcePage> {
        self.pages.cached()
    }

    pub fn observe(&self) -> QueryObserver {
        self.pages.observe()
    }

    pub fn page(&self, page: u32) -> Self {
        Self {
            pages: self.pages.page(page),
            ..self.clone()
        }
    }

    /// Invalidate every page of this scoped list.
    pub fn invalidate(&self) -> InvalidationReport {
        self.pages.client().invalidate(&self.scope())
    }
}
