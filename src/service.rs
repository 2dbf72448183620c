use std::sync::Arc;

use crate::{
    config::Config,
    db::Database,
    dispatch::{DispatchPool, Dispatcher, TaskAccess},
    id::IdGenerator,
    queue::{reclaim::Reclaimer, QueueService, SqliteQueueStore, WELL_KNOWN},
};

/// Everything a running node needs, connected in dependency order.
pub struct Service {
    config: Config,
    ids: Arc<IdGenerator>,
    db: Database,
    queues: QueueService,
    dispatcher: Dispatcher,
}

impl Service {
    pub async fn connect() -> eyre::Result<Self> {
        Self::connect_with(Config::load()?).await
    }

    pub async fn connect_with(config: Config) -> eyre::Result<Self> {
        // Entities get their ids from here, so it must exist before anything
        // that creates them.
        let ids = Arc::new(IdGenerator::new(config.node_number)?);

        let db = Database::connect(&config.db_path, config.store_timeout()).await?;

        let store = SqliteQueueStore::connect(
            &config.queue_path,
            config.consumer_group(),
            config.store_timeout(),
        )
        .await?;
        let queues = QueueService::new(store);

        let dispatcher = Dispatcher::builder()
            .db(db.clone())
            .queues(queues.clone())
            .ids(ids.clone())
            .access(Arc::new(TaskAccess::new(db.clone())))
            .lease(config.dispatch_lease())
            .max_attempts(config.dispatch_max_attempts())
            .build();

        tracing::info!(
            node = config.node_number,
            group = config.consumer_group(),
            "service connected"
        );

        Ok(Self {
            config,
            ids,
            db,
            queues,
            dispatcher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ids(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn queues(&self) -> &QueueService {
        &self.queues
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Creates the well-known queues that do not exist yet.
    pub async fn provision(&self) -> eyre::Result<()> {
        self.queues.provision(&WELL_KNOWN).await?;
        Ok(())
    }

    pub fn dispatch_pool(&self) -> DispatchPool {
        DispatchPool::new(
            self.dispatcher.clone(),
            self.config.dispatch_workers(),
            self.config.dispatch_poll(),
        )
    }

    pub fn reclaimer(&self) -> Reclaimer {
        Reclaimer::new(
            self.queues.store().clone(),
            WELL_KNOWN,
            self.config.reclaim_interval(),
            self.config.reclaim_min_idle(),
        )
    }
}
