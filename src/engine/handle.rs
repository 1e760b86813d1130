use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::feed::FeedFilter;
use crate::storage::{FeedItem, FeedSource, RegistryError};

/// The engine task is gone; no further commands can be served.
#[derive(Debug, Error)]
#[error("Feed engine has shut down")]
pub struct EngineClosed;

/// Requests accepted by a running engine.
#[derive(Debug)]
pub enum EngineCommand {
    Fetch(String),
    FetchAll,
    MarkRead {
        url: String,
        guid: String,
    },
    MarkAllRead(String),
    ClearCache,
    AddFeed {
        source: FeedSource,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    RemoveFeed {
        name: String,
        reply: oneshot::Sender<Result<bool, RegistryError>>,
    },
    Items {
        url: String,
        filter: FeedFilter,
        reply: oneshot::Sender<Vec<FeedItem>>,
    },
    Feeds {
        reply: oneshot::Sender<Vec<FeedSource>>,
    },
    Categories {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

/// Cloneable front end for an engine running on its own task.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub(crate) fn new(commands: mpsc::Sender<EngineCommand>) -> Self {
        Self { commands }
    }

    async fn send(&self, command: EngineCommand) -> Result<(), EngineClosed> {
        self.commands.send(command).await.map_err(|_| EngineClosed)
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> EngineCommand,
    ) -> Result<R, EngineClosed> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply)).await?;
        response.await.map_err(|_| EngineClosed)
    }

    pub async fn fetch(&self, url: impl Into<String>) -> Result<(), EngineClosed> {
        self.send(EngineCommand::Fetch(url.into())).await
    }

    pub async fn fetch_all(&self) -> Result<(), EngineClosed> {
        self.send(EngineCommand::FetchAll).await
    }

    pub async fn mark_read(
        &self,
        url: impl Into<String>,
        guid: impl Into<String>,
    ) -> Result<(), EngineClosed> {
        self.send(EngineCommand::MarkRead {
            url: url.into(),
            guid: guid.into(),
        })
        .await
    }

    pub async fn mark_all_read(&self, url: impl Into<String>) -> Result<(), EngineClosed> {
        self.send(EngineCommand::MarkAllRead(url.into())).await
    }

    pub async fn clear_cache(&self) -> Result<(), EngineClosed> {
        self.send(EngineCommand::ClearCache).await
    }

    pub async fn add_feed(&self, source: FeedSource) -> Result<Result<(), RegistryError>, EngineClosed> {
        self.request(|reply| EngineCommand::AddFeed { source, reply })
            .await
    }

    pub async fn remove_feed(
        &self,
        name: impl Into<String>,
    ) -> Result<Result<bool, RegistryError>, EngineClosed> {
        let name = name.into();
        self.request(|reply| EngineCommand::RemoveFeed { name, reply })
            .await
    }

    pub async fn items(
        &self,
        url: impl Into<String>,
        filter: FeedFilter,
    ) -> Result<Vec<FeedItem>, EngineClosed> {
        let url = url.into();
        self.request(|reply| EngineCommand::Items { url, filter, reply })
            .await
    }

    pub async fn feeds(&self) -> Result<Vec<FeedSource>, EngineClosed> {
        self.request(|reply| EngineCommand::Feeds { reply }).await
    }

    pub async fn categories(&self) -> Result<Vec<String>, EngineClosed> {
        self.request(|reply| EngineCommand::Categories { reply })
            .await
    }

    /// Ask the engine to stop. In-flight attempts are aborted.
    pub async fn shutdown(&self) -> Result<(), EngineClosed> {
        self.send(EngineCommand::Shutdown).await
    }
}
