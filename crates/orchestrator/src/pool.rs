#![forbid(unsafe_code)]

use crate::OrchestratorError;
use quarry_storage::{QueueDriver, QueueDriverConnection, StoreError};
use std::sync::{Arc, Mutex, PoisonError};

const MAX_IDLE_CONNECTIONS: usize = 8;

/// Reuses blocking queue connections and runs store calls off the async executor.
pub(crate) struct ConnectionPool {
    driver: Arc<dyn QueueDriver>,
    idle: Mutex<Vec<Box<dyn QueueDriverConnection>>>,
}

impl ConnectionPool {
    pub(crate) fn new(driver: Arc<dyn QueueDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            idle: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn driver(&self) -> &dyn QueueDriver {
        self.driver.as_ref()
    }

    pub(crate) async fn run<T, F>(self: &Arc<Self>, op: F) -> Result<T, OrchestratorError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn QueueDriverConnection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = Arc::clone(self);
        let out = tokio::task::spawn_blocking(move || {
            let mut conn = pool.checkout()?;
            let out = op(conn.as_mut());
            pool.checkin(conn);
            out
        })
        .await??;
        Ok(out)
    }

    fn checkout(&self) -> Result<Box<dyn QueueDriverConnection>, StoreError> {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match reused {
            Some(conn) => Ok(conn),
            None => self.driver.create_connection(),
        }
    }

    fn checkin(&self, conn: Box<dyn QueueDriverConnection>) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }
}
