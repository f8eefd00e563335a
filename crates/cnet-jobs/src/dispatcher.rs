//! Job dispatcher: turns a target collection into queued job messages.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use cnet_core::{
    encode_message, Error, FunctionRef, GraphSource, ImagePath, JobMessage, Result,
    RowSelection, RowSource, TargetId, TargetKind,
};
use cnet_queue::TaskQueue;

use crate::options::ApplyOptions;
use crate::registry::OperationRegistry;

/// What a dispatch iterates over.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchTarget {
    /// Nodes or edges of the attached image graph.
    Graph(TargetKind),
    /// Rows of the table backing a row kind.
    Rows(TargetKind),
    /// An arbitrary finite collection; each element becomes one message.
    Items(Vec<JsonValue>),
}

impl DispatchTarget {
    pub fn kind(&self) -> TargetKind {
        match self {
            DispatchTarget::Graph(kind) | DispatchTarget::Rows(kind) => *kind,
            DispatchTarget::Items(_) => TargetKind::Item,
        }
    }
}

impl FromStr for DispatchTarget {
    type Err = Error;

    /// Parse an `on` string: a graph collection or a table name (with aliases).
    fn from_str(on: &str) -> Result<Self> {
        let kind: TargetKind = on.parse()?;
        if kind.is_graph() {
            Ok(DispatchTarget::Graph(kind))
        } else if kind.is_row() {
            Ok(DispatchTarget::Rows(kind))
        } else {
            Err(Error::UnknownTarget(format!(
                "'{}' names no collection; pass the items themselves",
                on
            )))
        }
    }
}

/// Builds and pushes job messages for one run.
pub struct Dispatcher {
    queue: TaskQueue,
    config: JsonValue,
    registry: Arc<OperationRegistry>,
    graph: Option<Arc<dyn GraphSource>>,
    rows: Option<Arc<dyn RowSource>>,
}

impl Dispatcher {
    /// `config` is the run configuration embedded in every message.
    pub fn new(queue: TaskQueue, config: JsonValue, registry: Arc<OperationRegistry>) -> Self {
        Self {
            queue,
            config,
            registry,
            graph: None,
            rows: None,
        }
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphSource>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_rows(mut self, rows: Arc<dyn RowSource>) -> Self {
        self.rows = Some(rows);
        self
    }

    /// Push one message per target element onto the processing queue.
    ///
    /// Every message is encoded before the first push, so a target that fails
    /// to resolve or encode leaves the queue untouched. Returns the number of
    /// messages pushed.
    #[instrument(
        skip(self, target, function, opts),
        fields(subsystem = "dispatch", function = %function.name(), target_kind = %target.kind())
    )]
    pub async fn dispatch(
        &self,
        target: &DispatchTarget,
        function: &FunctionRef,
        opts: &ApplyOptions,
    ) -> Result<usize> {
        let start = Instant::now();
        let messages = match target {
            DispatchTarget::Graph(kind) => self.graph_messages(*kind, function, opts)?,
            DispatchTarget::Rows(kind) => self.row_messages(*kind, function, opts).await?,
            DispatchTarget::Items(items) => self.item_messages(items, function, opts)?,
        };

        let encoded = messages
            .iter()
            .map(encode_message)
            .collect::<Result<Vec<String>>>()?;

        if encoded.is_empty() {
            info!("No dispatchable elements; nothing queued");
            return Ok(0);
        }

        let pushed = self
            .queue
            .push_batch(&self.queue.names().processing, &encoded)
            .await?;

        info!(
            job_count = pushed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Dispatched jobs"
        );
        Ok(pushed)
    }

    fn message(
        &self,
        id: TargetId,
        along: TargetKind,
        image_path: Option<ImagePath>,
        function: &FunctionRef,
        opts: &ApplyOptions,
    ) -> JobMessage {
        JobMessage {
            id,
            along,
            func: function.wire_identifier(),
            args: opts.args.clone(),
            kwargs: opts.kwargs.clone(),
            walltime: opts.walltime.clone(),
            image_path,
            param_step: cnet_core::defaults::PARAM_STEP,
            config: self.config.clone(),
        }
    }

    fn graph_messages(
        &self,
        kind: TargetKind,
        function: &FunctionRef,
        opts: &ApplyOptions,
    ) -> Result<Vec<JobMessage>> {
        let graph = self.graph.as_ref().ok_or_else(|| {
            Error::UnknownTarget(format!("no image graph is attached to dispatch {}s", kind))
        })?;
        self.registry.check(function, kind)?;

        let elements = match kind {
            TargetKind::Edge => graph.edges(),
            _ => graph.nodes(),
        };

        let mut skipped = 0usize;
        let mut messages = Vec::with_capacity(elements.len());
        for element in elements {
            if element.ignore {
                skipped += 1;
                continue;
            }
            // Tag from the identity itself: an endpoint pair is an edge.
            let along = element.id.kind();
            messages.push(self.message(
                element.id.into(),
                along,
                element.image_path.clone(),
                function,
                opts,
            ));
        }
        debug!(
            job_count = messages.len(),
            skipped, "Built graph object messages"
        );
        Ok(messages)
    }

    async fn row_messages(
        &self,
        kind: TargetKind,
        function: &FunctionRef,
        opts: &ApplyOptions,
    ) -> Result<Vec<JobMessage>> {
        let rows = self.rows.as_ref().ok_or_else(|| {
            Error::UnknownTarget(format!("no database is attached to dispatch {} rows", kind))
        })?;

        let query = opts
            .query_string
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty());
        let selection = match query {
            Some(sql) => {
                if !opts.filters.is_empty() {
                    warn!(
                        filters = ?opts.filters.keys().collect::<Vec<_>>(),
                        "Filters and a query string were both given; filters are ignored"
                    );
                }
                RowSelection::Query(sql.to_string())
            }
            None if !opts.filters.is_empty() => RowSelection::Filters(opts.filters.clone()),
            None => RowSelection::All,
        };

        // The row source has released its connection by the time ids come back.
        let ids = rows.row_ids(kind, &selection).await?;
        if ids.is_empty() {
            return Err(Error::EmptyTarget(format!(
                "the {} query returned no rows",
                kind
            )));
        }
        debug!(row_count = ids.len(), "Resolved dispatch rows");

        Ok(ids
            .into_iter()
            .map(|id| self.message(TargetId::Row(id), kind, None, function, opts))
            .collect())
    }

    fn item_messages(
        &self,
        items: &[JsonValue],
        function: &FunctionRef,
        opts: &ApplyOptions,
    ) -> Result<Vec<JobMessage>> {
        if items.is_empty() {
            return Err(Error::EmptyTarget("the iterable is empty".into()));
        }
        Ok(items
            .iter()
            .map(|item| {
                self.message(
                    TargetId::Item(item.clone()),
                    TargetKind::Item,
                    None,
                    function,
                    opts,
                )
            })
            .collect())
    }
}
