use std::sync::Arc;
use std::time::Duration;

use cadence::{CountedExt, StatsdClient};
use futures::StreamExt;
use google_cloud_rust_raw::bigtable::v2::bigtable;
use google_cloud_rust_raw::bigtable::v2::data;
use grpcio::{CallOption, MetadataBuilder};

use crate::error::{BigtableError, BigtableResult};
use crate::mutation::{Mutation, ReadModifyWrite};
use crate::pool::BigtablePool;
use crate::retry::RetryPolicy;
use crate::row::Row;
use crate::settings::BigtableDbSettings;
use crate::RowKey;

/// Handle on one Bigtable instance.
///
/// Owns the channel pool and the default request metadata; vends per-table
/// handles. Create once, share freely (it is cheap to clone), close once at
/// shutdown.
#[derive(Clone)]
pub struct BigtableClient {
    pub(crate) settings: BigtableDbSettings,
    pool: BigtablePool,
    metrics: Arc<StatsdClient>,
    retry: RetryPolicy,
}

impl BigtableClient {
    pub fn new(metrics: Arc<StatsdClient>, settings: BigtableDbSettings) -> BigtableResult<Self> {
        debug!("🉑 {:#?}", settings);
        let pool = BigtablePool::new(&settings, &metrics)?;
        Ok(Self {
            settings,
            pool,
            metrics,
            retry: RetryPolicy::default(),
        })
    }

    /// A handle for one table. Handles are thin views over the shared pool
    /// and are safe for concurrent use.
    pub fn table(&self, table_id: &str) -> Table {
        let table_name = self.settings.table_name(table_id);
        // `table_name=<escaped>&app_profile_id=<escaped>`, the routing
        // header the frontend expects on every data RPC.
        let request_params = form_urlencoded::Serializer::new(String::new())
            .append_pair("table_name", &table_name)
            .append_pair("app_profile_id", &self.settings.app_profile_id)
            .finish();
        Table {
            pool: self.pool.clone(),
            metrics: self.metrics.clone(),
            retry: self.retry,
            table_name,
            app_profile_id: self.settings.app_profile_id.clone(),
            request_params,
            call_timeout: self
                .settings
                .operation_timeout
                .map(|ms| Duration::from_millis(ms as u64)),
        }
    }

    /// Close the shared pool. Existing table handles fail after this; call
    /// once at shutdown.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Handle on one table. All data operations live here.
#[derive(Clone)]
pub struct Table {
    pub(crate) pool: BigtablePool,
    pub(crate) metrics: Arc<StatsdClient>,
    pub(crate) retry: RetryPolicy,
    /// `projects/{project}/instances/{instance}/tables/{table}`
    pub(crate) table_name: String,
    pub(crate) app_profile_id: String,
    pub(crate) request_params: String,
    pub(crate) call_timeout: Option<Duration>,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.table_name
    }

    /// Per-call options: the table-scoped metadata headers plus the
    /// configured deadline.
    pub(crate) fn call_opts(&self) -> BigtableResult<CallOption> {
        let mut metadata = MetadataBuilder::new();
        metadata
            .add_str("google-cloud-resource-prefix", &self.table_name)
            .map_err(|e| BigtableError::Validation(e.to_string()))?;
        metadata
            .add_str("x-goog-request-params", &self.request_params)
            .map_err(|e| BigtableError::Validation(e.to_string()))?;
        let mut opts = CallOption::default().headers(metadata.build());
        if let Some(timeout) = self.call_timeout {
            opts = opts.timeout(timeout);
        }
        Ok(opts)
    }

    pub(crate) fn count_retry(&self, err: &BigtableError) {
        self.metrics
            .incr_with_tags("database.retry")
            .with_tag("error", err.metric_label())
            .send();
    }

    /// Apply a mutation to one row, atomically.
    ///
    /// For a conditional mutation the returned value reports whether the
    /// predicate matched; unconditional mutations return `None`. Retried
    /// only while the mutation is idempotent (no server-stamped cell
    /// writes in any branch that would run again).
    pub async fn apply(
        &self,
        row_key: impl Into<RowKey>,
        mutation: &Mutation,
    ) -> BigtableResult<Option<bool>> {
        let row_key: RowKey = row_key.into();
        if mutation.is_conditional() {
            self.check_and_mutate_row(row_key, mutation).await.map(Some)
        } else {
            self.mutate_row(row_key, mutation).await.map(|_| None)
        }
    }

    async fn mutate_row(&self, row_key: RowKey, mutation: &Mutation) -> BigtableResult<()> {
        let mut req = bigtable::MutateRowRequest::default();
        req.set_table_name(self.table_name.clone());
        req.set_app_profile_id(self.app_profile_id.clone());
        req.set_row_key(row_key);
        req.set_mutations(mutation.wire_ops());

        let idempotent = mutation.is_idempotent();
        let mut backoff = self.retry.backoff();
        loop {
            let result = async {
                let conn = self.pool.get().await?;
                conn.conn
                    .mutate_row_async_opt(&req, self.call_opts()?)
                    .map_err(BigtableError::from)?
                    .await
                    .map_err(BigtableError::from)
            }
            .await;
            match result {
                Ok(_) => return Ok(()),
                Err(err) if idempotent && self.retry.is_retryable(&err) => {
                    self.count_retry(&err);
                    backoff.sleep().await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn check_and_mutate_row(
        &self,
        row_key: RowKey,
        mutation: &Mutation,
    ) -> BigtableResult<bool> {
        // Depth > 1 is rejected here, not at construction time.
        for branch in [&mutation.mtrue, &mutation.mfalse] {
            if branch.as_ref().map_or(false, |m| m.is_conditional()) {
                return Err(BigtableError::Validation(
                    "conditional mutations cannot be nested".to_owned(),
                ));
            }
        }

        let mut req = bigtable::CheckAndMutateRowRequest::default();
        req.set_table_name(self.table_name.clone());
        req.set_app_profile_id(self.app_profile_id.clone());
        req.set_row_key(row_key);
        if let Some(predicate) = &mutation.predicate {
            req.set_predicate_filter(predicate.clone());
        }
        if let Some(mtrue) = &mutation.mtrue {
            req.set_true_mutations(mtrue.wire_ops());
        }
        if let Some(mfalse) = &mutation.mfalse {
            req.set_false_mutations(mfalse.wire_ops());
        }

        let idempotent = mutation.is_idempotent();
        let mut backoff = self.retry.backoff();
        loop {
            let result = async {
                let conn = self.pool.get().await?;
                conn.conn
                    .check_and_mutate_row_async_opt(&req, self.call_opts()?)
                    .map_err(BigtableError::from)?
                    .await
                    .map_err(BigtableError::from)
            }
            .await;
            match result {
                Ok(response) => return Ok(response.get_predicate_matched()),
                Err(err) if idempotent && self.retry.is_retryable(&err) => {
                    self.count_retry(&err);
                    backoff.sleep().await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Execute read-modify-write rules against one row and return the new
    /// contents of the written cells. Never retried: an increment replayed
    /// is an increment doubled.
    pub async fn apply_read_modify_write(
        &self,
        row_key: impl Into<RowKey>,
        rules: &ReadModifyWrite,
    ) -> BigtableResult<Row> {
        if rules.is_empty() {
            return Err(BigtableError::Validation(
                "read-modify-write requires at least one rule".to_owned(),
            ));
        }
        let mut req = bigtable::ReadModifyWriteRowRequest::default();
        req.set_table_name(self.table_name.clone());
        req.set_app_profile_id(self.app_profile_id.clone());
        req.set_row_key(row_key.into());
        req.set_rules(rules.wire_rules());

        let conn = self.pool.get().await?;
        let mut response = conn
            .conn
            .read_modify_write_row_async_opt(&req, self.call_opts()?)
            .map_err(BigtableError::from)?
            .await
            .map_err(BigtableError::from)?;
        Ok(Row::from(response.take_row()))
    }

    /// A non-empty sample of row keys, suitable for splitting scan work into
    /// roughly equal shards. Retried end-to-end: partial samples from a
    /// broken stream are discarded.
    pub async fn sample_row_keys(&self) -> BigtableResult<Vec<RowKey>> {
        let mut backoff = self.retry.backoff();
        loop {
            match self.sample_row_keys_once().await {
                Ok(keys) => return Ok(keys),
                Err(err) if self.retry.is_retryable(&err) => {
                    self.count_retry(&err);
                    backoff.sleep().await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn sample_row_keys_once(&self) -> BigtableResult<Vec<RowKey>> {
        let mut req = bigtable::SampleRowKeysRequest::default();
        req.set_table_name(self.table_name.clone());
        req.set_app_profile_id(self.app_profile_id.clone());

        let conn = self.pool.get().await?;
        let mut stream = conn
            .conn
            .sample_row_keys_opt(&req, self.call_opts()?)
            .map_err(BigtableError::from)?;
        let mut keys = Vec::new();
        while let Some(response) = stream.next().await {
            let mut response = response.map_err(BigtableError::from)?;
            keys.push(response.take_row_key());
        }
        Ok(keys)
    }

    /// Cheap connectivity probe: read a sentinel key behind a block-all
    /// filter. We don't care about the (empty) result, only that the
    /// round-trip succeeds.
    pub async fn health_check(&self) -> BigtableResult<bool> {
        let mut req = bigtable::ReadRowsRequest::default();
        req.set_table_name(self.table_name.clone());
        req.set_app_profile_id(self.app_profile_id.clone());
        let mut row_set = data::RowSet::default();
        row_set.mut_row_keys().push(b"NOT_FOUND".to_vec());
        req.set_rows(row_set);
        let mut filter = data::RowFilter::default();
        filter.set_block_all_filter(true);
        req.set_filter(filter);

        let conn = self.pool.get().await?;
        let mut stream = conn
            .conn
            .read_rows_opt(&req, self.call_opts()?)
            .map_err(BigtableError::from)?;
        while let Some(response) = stream.next().await {
            response.map_err(BigtableError::from)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Timestamp;
    use crate::rows::RowSet;

    fn new_client() -> BigtableClient {
        let settings = BigtableDbSettings::try_from(
            r#"{"dsn": "grpc://localhost:8086", "project_id": "test", "instance_id": "test"}"#,
        )
        .unwrap();
        let metrics = Arc::new(StatsdClient::builder("", cadence::NopMetricSink).build());
        BigtableClient::new(metrics, settings).unwrap()
    }

    #[test]
    fn table_metadata() {
        let client = new_client();
        let table = client.table("device-data");
        assert_eq!(
            table.name(),
            "projects/test/instances/test/tables/device-data"
        );
        assert_eq!(
            table.request_params,
            "table_name=projects%2Ftest%2Finstances%2Ftest%2Ftables%2Fdevice-data&app_profile_id="
        );
    }

    #[actix_rt::test]
    async fn empty_selection_short_circuits() {
        // An empty application-level selection must return without issuing
        // any RPC (the wire treats an empty row set as "all rows").
        let table = new_client().table("unreachable");
        let mut seen = 0;
        table
            .read_rows(RowSet::List(vec![]), Default::default(), |_| {
                seen += 1;
                true
            })
            .await
            .unwrap();
        assert_eq!(seen, 0);

        table
            .read_rows(RowSet::Ranges(vec![]), Default::default(), |_| true)
            .await
            .unwrap();

        // a fully-narrowed range behaves the same way
        let spent = RowSet::Range(crate::rows::RowRange::closed_open("a", "b")).retain_after(b"b");
        table
            .read_rows(spent, Default::default(), |_| true)
            .await
            .unwrap();
    }

    #[actix_rt::test]
    async fn nested_conditionals_are_rejected() {
        let table = new_client().table("unreachable");
        let mut set = Mutation::new();
        set.set_cell("cf", "col", Timestamp(1_000), b"v".to_vec());
        let inner = Mutation::conditional(data::RowFilter::default(), Some(set), None);
        let outer = Mutation::conditional(data::RowFilter::default(), Some(inner), None);
        let err = table.apply(b"row".to_vec(), &outer).await.unwrap_err();
        assert!(matches!(err, BigtableError::Validation(_)));
    }

    #[actix_rt::test]
    async fn empty_read_modify_write_is_rejected() {
        let table = new_client().table("unreachable");
        let err = table
            .apply_read_modify_write(b"row".to_vec(), &ReadModifyWrite::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BigtableError::Validation(_)));
    }
}

#[cfg(all(test, feature = "emulator"))]
mod emulator_tests {
    //! These tests rely on a Bigtable emulator listening on localhost:8086,
    //! with the table pre-created:
    //!
    //!   cbt -project test -instance test createtable device-data
    //!   cbt -project test -instance test createfamily device-data cf

    use super::*;
    use crate::bulk::BulkOptions;
    use crate::mutation::Timestamp;
    use crate::read::ReadOptions;
    use crate::rows::{RowRange, RowSet};

    fn new_table() -> Table {
        let settings = BigtableDbSettings::try_from(
            r#"{"dsn": "grpc://localhost:8086", "project_id": "test", "instance_id": "test"}"#,
        )
        .unwrap();
        let metrics = Arc::new(StatsdClient::builder("", cadence::NopMetricSink).build());
        BigtableClient::new(metrics, settings)
            .unwrap()
            .table("device-data")
    }

    fn set_mutation(value: &[u8]) -> Mutation {
        let mut mutation = Mutation::new();
        mutation.set_cell("cf", "col", Timestamp::now(), value.to_vec());
        mutation
    }

    /// Run a gauntlet of testing. These are a bit linear because they need
    /// to run in sequence.
    #[actix_rt::test]
    async fn run_gauntlet() {
        let table = new_table();

        assert!(table.health_check().await.unwrap());

        // seed a handful of rows
        for key in ["gauntlet-a", "gauntlet-b", "gauntlet-c", "gauntlet-d"] {
            table.apply(key, &set_mutation(b"seed")).await.unwrap();
        }

        // range read comes back in order
        let mut keys = Vec::new();
        table
            .read_rows(
                RowSet::Range(RowRange::closed_open("gauntlet-a", "gauntlet-e")),
                ReadOptions::default(),
                |row| {
                    keys.push(row.row_key.clone());
                    true
                },
            )
            .await
            .unwrap();
        assert_eq!(
            keys,
            vec![
                b"gauntlet-a".to_vec(),
                b"gauntlet-b".to_vec(),
                b"gauntlet-c".to_vec(),
                b"gauntlet-d".to_vec(),
            ]
        );

        // reversed read with an early stop
        let mut first = None;
        table
            .read_rows(
                RowSet::Range(RowRange::closed_open("gauntlet-a", "gauntlet-e")),
                ReadOptions {
                    reversed: true,
                    ..Default::default()
                },
                |row| {
                    first = Some(row.row_key.clone());
                    false
                },
            )
            .await
            .unwrap();
        assert_eq!(first, Some(b"gauntlet-d".to_vec()));

        // prefix read
        let mut count = 0;
        table
            .read_rows(RowSet::prefix("gauntlet-"), ReadOptions::default(), |_| {
                count += 1;
                true
            })
            .await
            .unwrap();
        assert_eq!(count, 4);

        // single row
        let mut row = table.read_row("gauntlet-a", None).await.unwrap().unwrap();
        assert_eq!(row.take_cell("cf").unwrap().value, b"seed".to_vec());
        assert!(table.read_row("gauntlet-zz", None).await.unwrap().is_none());

        // bulk apply with one bad entry (empty mutations are rejected
        // per-entry by the server)
        let keys = vec![b"gauntlet-e".to_vec(), b"gauntlet-f".to_vec()];
        let muts = vec![set_mutation(b"bulk"), set_mutation(b"bulk")];
        let errs = table
            .apply_bulk(keys, &muts, BulkOptions::default())
            .await
            .unwrap();
        assert!(errs.is_none());

        // conditional: the predicate matches, so the false branch must not
        // run
        let mut matched_branch = Mutation::new();
        matched_branch.set_cell("cf", "col", Timestamp::now(), b"matched".to_vec());
        let mut filter = data::RowFilter::default();
        filter.set_pass_all_filter(true);
        let cond = Mutation::conditional(filter, Some(matched_branch), None);
        let matched = table.apply("gauntlet-a", &cond).await.unwrap();
        assert_eq!(matched, Some(true));

        // read-modify-write increment
        let mut rmw = ReadModifyWrite::new();
        rmw.increment("cf", "counter", 3);
        let mut row = table
            .apply_read_modify_write("gauntlet-a", &rmw)
            .await
            .unwrap();
        let cell = row.take_cell("cf").unwrap();
        assert_eq!(cell.value, 3i64.to_be_bytes().to_vec());

        // sample row keys: a non-empty sample marks the table end
        table.sample_row_keys().await.unwrap();

        // clean up our toys
        for key in [
            "gauntlet-a",
            "gauntlet-b",
            "gauntlet-c",
            "gauntlet-d",
            "gauntlet-e",
            "gauntlet-f",
        ] {
            let mut del = Mutation::new();
            del.delete_row();
            table.apply(key, &del).await.unwrap();
        }
    }
}
