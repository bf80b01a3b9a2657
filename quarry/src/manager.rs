//! The operational facade: translates find options into select builders,
//! runs them on a runner from the driver, and fronts the persistence
//! executor. One manager per data source; cheap to clone.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::criteria::Criterion;
use crate::driver::{Driver, QueryRunner, RunnerMode};
use crate::entity::EntityRef;
use crate::error::{QuarryError, QuarryResult};
use crate::metadata::MetadataRegistry;
use crate::persist::PersistExecutor;
use crate::query::{OrderDirection, SelectQueryBuilder};
use crate::value::Value;

/// Declarative query shape accepted by the find family.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub criteria: Option<Criterion>,
    /// Dotted relation paths to join and hydrate, e.g. `posts.categories`.
    pub relations: Vec<String>,
    /// Property paths to order by, innermost alias resolved through the
    /// joined relations.
    pub order: Vec<(String, OrderDirection)>,
    pub take: Option<u64>,
    pub skip: Option<u64>,
    pub with_deleted: bool,
}

impl FindOptions {
    pub fn criteria(mut self, criterion: Criterion) -> Self {
        self.criteria = Some(criterion);
        self
    }

    pub fn relation(mut self, path: impl Into<String>) -> Self {
        self.relations.push(path.into());
        self
    }

    pub fn order_by(mut self, path: impl Into<String>, direction: OrderDirection) -> Self {
        self.order.push((path.into(), direction));
        self
    }

    pub fn take(mut self, take: u64) -> Self {
        self.take = Some(take);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.with_deleted = true;
        self
    }
}

#[derive(Clone)]
pub struct EntityManager {
    registry: Arc<MetadataRegistry>,
    driver: Arc<dyn Driver>,
}

impl EntityManager {
    pub fn new(registry: Arc<MetadataRegistry>, driver: Arc<dyn Driver>) -> Self {
        Self { registry, driver }
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Escape hatch: a select builder rooted at `entity` under `alias`.
    pub fn create_query_builder(
        &self,
        entity: &str,
        alias: &str,
    ) -> QuarryResult<SelectQueryBuilder> {
        SelectQueryBuilder::new(Arc::clone(&self.registry), entity, alias)
    }

    /// Translate find options into a select builder rooted at the entity's
    /// own name. Unknown relation paths are collected and reported all at
    /// once.
    pub fn build_find(
        &self,
        entity: &str,
        options: &FindOptions,
    ) -> QuarryResult<SelectQueryBuilder> {
        let metadata = self.registry.get_by_name(entity)?;
        let root = metadata.name.clone();
        let mut builder = self.create_query_builder(entity, &root)?;

        let mut bad_paths = Vec::new();
        for path in &options.relations {
            let mut parent = root.clone();
            let mut failed = false;
            for segment in path.split('.') {
                match builder.ensure_relation_join(&parent, segment, true) {
                    Ok(alias) => parent = alias,
                    Err(_) => {
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                bad_paths.push(path.clone());
            }
        }
        if !bad_paths.is_empty() {
            return Err(QuarryError::RelationsNotFound {
                entity: root,
                paths: bad_paths,
            });
        }

        if let Some(criterion) = &options.criteria {
            builder = builder.where_criterion(criterion.clone())?;
        }
        for (path, direction) in &options.order {
            builder = builder.add_order_by(&self.order_path(&root, path), *direction);
        }
        if let Some(take) = options.take {
            builder = builder.take(take);
        }
        if let Some(skip) = options.skip {
            builder = builder.skip(skip);
        }
        if options.with_deleted {
            builder = builder.with_deleted();
        }
        Ok(builder)
    }

    /// Resolve a dotted order path (`posts.title`) against the relation
    /// alias scheme; a bare property stays on the root alias.
    fn order_path(&self, root: &str, path: &str) -> String {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.len() < 2 {
            return format!("{root}.{path}");
        }
        let mut alias = root.to_string();
        for segment in &segments[..segments.len() - 1] {
            alias = crate::query::relation_alias(&alias, segment);
        }
        format!("{alias}.{}", segments[segments.len() - 1])
    }

    pub async fn find(
        &self,
        entity: &str,
        options: FindOptions,
    ) -> QuarryResult<Vec<EntityRef>> {
        let builder = self.build_find(entity, &options)?;
        let mut runner = self.driver.create_query_runner(RunnerMode::Slave).await?;
        let result = builder
            .get_many(runner.as_mut(), self.driver.dialect())
            .await;
        runner.release().await?;
        result
    }

    pub async fn find_one(
        &self,
        entity: &str,
        options: FindOptions,
    ) -> QuarryResult<Option<EntityRef>> {
        let mut builder = self.build_find(entity, &options)?;
        // Without joined collections a single row is enough.
        if options.relations.is_empty() {
            builder = builder.limit(1);
        }
        let mut runner = self.driver.create_query_runner(RunnerMode::Slave).await?;
        let result = builder
            .get_one(runner.as_mut(), self.driver.dialect())
            .await;
        runner.release().await?;
        result
    }

    /// Single-column primary key lookup.
    pub async fn find_by_id(
        &self,
        entity: &str,
        id: impl Into<Value>,
    ) -> QuarryResult<Option<EntityRef>> {
        let metadata = self.registry.get_by_name(entity)?;
        if metadata.has_composite_primary_key() {
            return Err(QuarryError::query_validation(format!(
                "entity '{entity}' has a composite primary key; use find_by_ids"
            )));
        }
        let pk = metadata
            .primary_columns()
            .next()
            .ok_or_else(|| QuarryError::MissingPrimaryColumn {
                entity: entity.to_string(),
            })?;
        let mut map = BTreeMap::new();
        map.insert(pk.property_name.clone(), id.into());
        self.find_by_ids(entity, vec![map])
            .await
            .map(|mut found| if found.is_empty() { None } else { Some(found.remove(0)) })
    }

    /// Composite-key capable identifier lookup.
    pub async fn find_by_ids(
        &self,
        entity: &str,
        ids: Vec<BTreeMap<String, Value>>,
    ) -> QuarryResult<Vec<EntityRef>> {
        let metadata = self.registry.get_by_name(entity)?;
        let root = metadata.name.clone();
        let builder = self
            .create_query_builder(entity, &root)?
            .where_in_ids(ids);
        let mut runner = self.driver.create_query_runner(RunnerMode::Slave).await?;
        let result = builder
            .get_many(runner.as_mut(), self.driver.dialect())
            .await;
        runner.release().await?;
        result
    }

    pub async fn count(&self, entity: &str, options: FindOptions) -> QuarryResult<u64> {
        let builder = self.build_find(entity, &options)?;
        let mut runner = self.driver.create_query_runner(RunnerMode::Slave).await?;
        let result = builder
            .get_count(runner.as_mut(), self.driver.dialect())
            .await;
        runner.release().await?;
        result
    }

    pub async fn save(&self, entities: &[EntityRef]) -> QuarryResult<()> {
        self.run_persist(entities, PersistKind::Save).await
    }

    pub async fn remove(&self, entities: &[EntityRef]) -> QuarryResult<()> {
        self.run_persist(entities, PersistKind::Remove).await
    }

    pub async fn soft_remove(&self, entities: &[EntityRef]) -> QuarryResult<()> {
        self.run_persist(entities, PersistKind::SoftRemove).await
    }

    pub async fn recover(&self, entities: &[EntityRef]) -> QuarryResult<()> {
        self.run_persist(entities, PersistKind::Recover).await
    }

    async fn run_persist(&self, entities: &[EntityRef], kind: PersistKind) -> QuarryResult<()> {
        let executor = PersistExecutor::new(Arc::clone(&self.registry), Arc::clone(&self.driver));
        let mut runner = self.driver.create_query_runner(RunnerMode::Master).await?;
        let result = match kind {
            PersistKind::Save => executor.save(runner.as_mut(), entities).await,
            PersistKind::Remove => executor.remove(runner.as_mut(), entities).await,
            PersistKind::SoftRemove => executor.soft_remove(runner.as_mut(), entities).await,
            PersistKind::Recover => executor.recover(runner.as_mut(), entities).await,
        };
        runner.release().await?;
        result
    }

    /// Run `work` on one runner inside a transaction, committing on `Ok`
    /// and rolling back on `Err`.
    pub async fn transaction<T>(
        &self,
        work: impl for<'a> FnOnce(
            &'a mut dyn QueryRunner,
        ) -> Pin<Box<dyn Future<Output = QuarryResult<T>> + Send + 'a>>,
    ) -> QuarryResult<T> {
        let mut runner = self.driver.create_query_runner(RunnerMode::Master).await?;
        runner.start_transaction().await?;
        match work(runner.as_mut()).await {
            Ok(value) => {
                runner.commit_transaction().await?;
                runner.release().await?;
                Ok(value)
            }
            Err(e) => {
                let _ = runner.rollback_transaction().await;
                runner.release().await?;
                Err(e)
            }
        }
    }

    /// Entity-scoped facade over this manager.
    pub fn repository(&self, entity: &str) -> QuarryResult<Repository> {
        self.registry.get_by_name(entity)?;
        Ok(Repository {
            manager: self.clone(),
            entity: entity.to_string(),
        })
    }
}

enum PersistKind {
    Save,
    Remove,
    SoftRemove,
    Recover,
}

/// An [`EntityManager`] pinned to one entity.
#[derive(Clone)]
pub struct Repository {
    manager: EntityManager,
    entity: String,
}

impl Repository {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub async fn find(&self, options: FindOptions) -> QuarryResult<Vec<EntityRef>> {
        self.manager.find(&self.entity, options).await
    }

    pub async fn find_one(&self, options: FindOptions) -> QuarryResult<Option<EntityRef>> {
        self.manager.find_one(&self.entity, options).await
    }

    pub async fn find_by_id(&self, id: impl Into<Value>) -> QuarryResult<Option<EntityRef>> {
        self.manager.find_by_id(&self.entity, id).await
    }

    pub async fn count(&self, options: FindOptions) -> QuarryResult<u64> {
        self.manager.count(&self.entity, options).await
    }

    pub async fn save(&self, entities: &[EntityRef]) -> QuarryResult<()> {
        self.manager.save(entities).await
    }

    pub async fn remove(&self, entities: &[EntityRef]) -> QuarryResult<()> {
        self.manager.remove(entities).await
    }

    pub async fn soft_remove(&self, entities: &[EntityRef]) -> QuarryResult<()> {
        self.manager.soft_remove(entities).await
    }

    pub async fn recover(&self, entities: &[EntityRef]) -> QuarryResult<()> {
        self.manager.recover(entities).await
    }

    pub fn query(&self, alias: &str) -> QuarryResult<SelectQueryBuilder> {
        self.manager.create_query_builder(&self.entity, alias)
    }
}
