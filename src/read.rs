use std::time::Duration;

use futures::StreamExt;
use google_cloud_rust_raw::bigtable::v2::bigtable::{
    ReadRowsRequest, ReadRowsRequest_RequestStatsView,
};
use google_cloud_rust_raw::bigtable::v2::data;
use google_cloud_rust_raw::bigtable::v2::request_stats::RequestStats;

use crate::client::Table;
use crate::error::{BigtableError, BigtableResult};
use crate::merge::RowMerger;
use crate::row::Row;
use crate::rows::RowSet;
use crate::RowKey;

/// Read statistics reported by the server when a stats sink is installed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FullReadStats {
    pub rows_seen: i64,
    pub rows_returned: i64,
    pub cells_seen: i64,
    pub cells_returned: i64,
    pub frontend_server_latency: Duration,
}

impl FullReadStats {
    fn from_wire(mut stats: RequestStats) -> Self {
        if !stats.has_full_read_stats_view() {
            return Self::default();
        }
        let mut view = stats.take_full_read_stats_view();
        let iteration = view.take_read_iteration_stats();
        let latency = view.take_request_latency_stats();
        let frontend = latency.get_frontend_server_latency();
        FullReadStats {
            rows_seen: iteration.get_rows_seen_count(),
            rows_returned: iteration.get_rows_returned_count(),
            cells_seen: iteration.get_cells_seen_count(),
            cells_returned: iteration.get_cells_returned_count(),
            frontend_server_latency: Duration::new(
                frontend.get_seconds().max(0) as u64,
                frontend.get_nanos().max(0) as u32,
            ),
        }
    }
}

/// Options for [`Table::read_rows`].
#[derive(Default)]
pub struct ReadOptions {
    /// Server-side row filter.
    pub filter: Option<data::RowFilter>,
    /// Cap on rows delivered across the whole operation, retries included.
    pub rows_limit: Option<i64>,
    /// Scan in descending key order.
    pub reversed: bool,
    /// Receives the request stats; invoked at most once per operation.
    pub stats: Option<Box<dyn FnMut(FullReadStats) + Send>>,
}

impl Table {
    /// Stream the rows selected by `rows` through `sink`, in key order
    /// (descending when reversed).
    ///
    /// The sink runs serially in the reader's execution context: blocking in
    /// it delays further chunk processing and back-pressures the server
    /// stream. Returning `false` from the sink stops the scan early; an
    /// early stop is a success, not an error.
    ///
    /// Retryable stream failures re-issue the request with the selection
    /// narrowed past the last key the broken stream got to, so no row is
    /// delivered twice.
    pub async fn read_rows<F>(
        &self,
        rows: RowSet,
        options: ReadOptions,
        mut sink: F,
    ) -> BigtableResult<()>
    where
        F: FnMut(Row) -> bool,
    {
        let ReadOptions {
            filter,
            rows_limit,
            reversed,
            mut stats,
        } = options;

        let mut row_set = rows;
        let mut remaining = rows_limit;
        let mut stats_sent = false;
        let mut backoff = self.retry.backoff();

        loop {
            // An empty selection means "nothing", but an empty wire row set
            // means "everything": never let the former hit the wire.
            if !row_set.is_nonempty() {
                return Ok(());
            }
            if matches!(remaining, Some(n) if n <= 0) {
                return Ok(());
            }

            let mut req = ReadRowsRequest::default();
            req.set_table_name(self.table_name.clone());
            req.set_app_profile_id(self.app_profile_id.clone());
            req.set_rows(row_set.to_wire());
            if let Some(filter) = &filter {
                req.set_filter(filter.clone());
            }
            if let Some(limit) = remaining {
                req.set_rows_limit(limit);
            }
            if reversed {
                req.set_reversed(true);
            }
            if stats.is_some() && !stats_sent {
                req.set_request_stats_view(ReadRowsRequest_RequestStatsView::REQUEST_STATS_FULL);
            }

            let conn = self.pool.get().await?;
            let mut stream = conn
                .conn
                .read_rows_opt(&req, self.call_opts()?)
                .map_err(BigtableError::from)?;
            let mut merger = RowMerger::new(reversed);
            let mut delivered: i64 = 0;

            let failure = loop {
                match stream.next().await {
                    None => break None,
                    Some(Err(e)) => break Some(BigtableError::from(e)),
                    Some(Ok(mut response)) => {
                        for chunk in response.take_chunks().into_iter() {
                            if let Some(row) = merger.merge_chunk(chunk)? {
                                delivered += 1;
                                if !sink(row) {
                                    // A voluntary stop: tear the stream down
                                    // and report success.
                                    stream.cancel();
                                    while stream.next().await.is_some() {}
                                    return Ok(());
                                }
                            }
                        }
                        if !response.last_scanned_row_key.is_empty() {
                            merger.mark_last_scanned(response.take_last_scanned_row_key());
                        }
                        if response.has_request_stats() && !stats_sent {
                            if let Some(stats_sink) = stats.as_mut() {
                                stats_sink(FullReadStats::from_wire(response.take_request_stats()));
                                stats_sent = true;
                            }
                        }
                    }
                }
            };

            match failure {
                None => {
                    merger.finalize()?;
                    return Ok(());
                }
                Some(err) if self.retry.is_retryable(&err) => {
                    if let Some(last) = merger.last_seen() {
                        row_set = if reversed {
                            row_set.retain_before(last)
                        } else {
                            row_set.retain_after(last)
                        };
                    }
                    if let Some(limit) = remaining {
                        remaining = Some(limit - delivered);
                    }
                    debug!("🔁 Retrying read: {:?}", err.code());
                    self.count_retry(&err);
                    backoff.sleep().await;
                }
                Some(err) => return Err(err),
            }
        }
    }

    /// Read a single row. `None` if the row does not exist.
    pub async fn read_row(
        &self,
        row_key: impl Into<RowKey>,
        filter: Option<data::RowFilter>,
    ) -> BigtableResult<Option<Row>> {
        let mut found = None;
        let options = ReadOptions {
            filter,
            rows_limit: Some(1),
            ..Default::default()
        };
        self.read_rows(RowSet::single(row_key), options, |row| {
            found = Some(row);
            false
        })
        .await?;
        Ok(found)
    }
}
