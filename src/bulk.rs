use std::ops::Range;

use futures::StreamExt;
use google_cloud_rust_raw::bigtable::v2::bigtable::{
    MutateRowsRequest, MutateRowsRequest_Entry, MutateRowsResponse,
};
use grpcio::RpcStatusCode;
use protobuf::RepeatedField;

use crate::client::Table;
use crate::error::{BigtableError, BigtableResult};
use crate::mutation::Mutation;
use crate::retry::RetryPolicy;
use crate::RowKey;

/// Upper bound on the total op count a single `MutateRows` RPC may carry.
pub const MAX_MUTATIONS: usize = 100_000;

/// Options for [`Table::apply_bulk`].
#[derive(Default)]
pub struct BulkOptions {
    /// Invoked after each server response on the bulk stream, once the
    /// response's entry statuses have been recorded.
    pub after: Option<Box<dyn FnMut(&MutateRowsResponse) + Send>>,
}

/// One caller entry and its current outcome.
struct EntryErr {
    entry: MutateRowsRequest_Entry,
    idempotent: bool,
    err: Option<BigtableError>,
}

impl Table {
    /// Apply each `(row_keys[i], mutations[i])` pair as an independent,
    /// atomic row mutation. The batch is split into op-count-capped groups,
    /// and within each group entries that fail with a retryable status (and
    /// are idempotent) are retried by themselves.
    ///
    /// Returns `None` when every entry succeeded; otherwise one slot per
    /// entry, `None` where that entry succeeded. A top-level error means no
    /// per-entry information is available. No ordering is provided between
    /// entries: each is atomic, the set is not.
    pub async fn apply_bulk(
        &self,
        row_keys: Vec<RowKey>,
        mutations: &[Mutation],
        options: BulkOptions,
    ) -> BigtableResult<Option<Vec<Option<BigtableError>>>> {
        if row_keys.len() != mutations.len() {
            return Err(BigtableError::Validation(
                "mismatched row-key and mutation array lengths".to_owned(),
            ));
        }
        let mut entries = Vec::with_capacity(row_keys.len());
        for (row_key, mutation) in row_keys.into_iter().zip(mutations.iter()) {
            if mutation.is_conditional() {
                return Err(BigtableError::Validation(
                    "conditional mutations cannot be applied in bulk".to_owned(),
                ));
            }
            let mut entry = MutateRowsRequest_Entry::default();
            entry.set_row_key(row_key);
            entry.set_mutations(mutation.wire_ops());
            entries.push(EntryErr {
                entry,
                idempotent: mutation.is_idempotent(),
                err: None,
            });
        }

        let mut after = options.after;
        let op_counts: Vec<usize> = mutations.iter().map(Mutation::op_count).collect();
        for group in group_boundaries(&op_counts, MAX_MUTATIONS) {
            self.apply_group(&mut entries[group], &mut after).await?;
        }

        let errs: Vec<Option<BigtableError>> =
            entries.into_iter().map(|entry| entry.err).collect();
        if errs.iter().all(Option::is_none) {
            Ok(None)
        } else {
            Ok(Some(errs))
        }
    }

    /// Drive one group to completion: whole-RPC failures retry the whole
    /// outstanding subset, per-entry retryable failures shrink it.
    async fn apply_group(
        &self,
        group: &mut [EntryErr],
        after: &mut Option<Box<dyn FnMut(&MutateRowsResponse) + Send>>,
    ) -> BigtableResult<()> {
        let mut backoff = self.retry.backoff();
        // positions within `group` going into the next RPC
        let mut pending: Vec<usize> = (0..group.len()).collect();
        loop {
            match self.mutate_rows_once(group, &pending, after).await {
                Ok(()) => {}
                Err(err) if self.retry.is_retryable(&err) => {
                    self.count_retry(&err);
                    backoff.sleep().await;
                    continue;
                }
                Err(err) => return Err(err),
            }

            let retryable = retry_subset(group, &pending, &self.retry);
            if retryable.is_empty() {
                return Ok(());
            }
            debug!("🔁 Retrying {} of {} bulk entries", retryable.len(), pending.len());
            if let Some(slot) = retryable.first() {
                if let Some(err) = &group[*slot].err {
                    self.count_retry(err);
                }
            }
            pending = retryable;
            backoff.sleep().await;
        }
    }

    /// One `MutateRows` RPC over the pending subset, stamping each entry's
    /// result slot from the streamed statuses.
    async fn mutate_rows_once(
        &self,
        group: &mut [EntryErr],
        pending: &[usize],
        after: &mut Option<Box<dyn FnMut(&MutateRowsResponse) + Send>>,
    ) -> BigtableResult<()> {
        let mut req = MutateRowsRequest::default();
        req.set_table_name(self.table_name.clone());
        req.set_app_profile_id(self.app_profile_id.clone());
        req.set_entries(RepeatedField::from_vec(
            pending
                .iter()
                .map(|&slot| group[slot].entry.clone())
                .collect(),
        ));

        let conn = self.pool.get().await?;
        let mut stream = conn
            .conn
            .mutate_rows_opt(&req, self.call_opts()?)
            .map_err(BigtableError::from)?;
        while let Some(response) = stream.next().await {
            let response = response.map_err(BigtableError::from)?;
            for entry in response.get_entries() {
                let index = entry.get_index() as usize;
                let slot = match pending.get(index) {
                    Some(&slot) => slot,
                    None => {
                        return Err(BigtableError::InvalidRowResponse(format!(
                            "bulk entry index {index} out of range"
                        )))
                    }
                };
                let status = entry.get_status();
                group[slot].err = if status.get_code() == 0 {
                    None
                } else {
                    Some(BigtableError::Rpc {
                        code: RpcStatusCode::from(status.get_code()),
                        message: status.get_message().to_owned(),
                    })
                };
            }
            if let Some(after) = after.as_mut() {
                after(&response);
            }
        }
        Ok(())
    }
}

/// Entries (by position) whose recorded error is retryable and whose
/// mutations are idempotent. Everything else sticks.
fn retry_subset(group: &[EntryErr], pending: &[usize], policy: &RetryPolicy) -> Vec<usize> {
    pending
        .iter()
        .copied()
        .filter(|&slot| {
            group[slot].idempotent
                && group[slot]
                    .err
                    .as_ref()
                    .map_or(false, |err| policy.is_retryable(err))
        })
        .collect()
}

/// Greedy partition of the entry sequence: a new group starts whenever
/// adding the next entry would push the running op count over `cap`.
/// Entries are never split and no group is empty.
fn group_boundaries(op_counts: &[usize], cap: usize) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut start = 0;
    let mut size = 0;
    for (i, &ops) in op_counts.iter().enumerate() {
        if i > start && size + ops > cap {
            groups.push(start..i);
            start = i;
            size = 0;
        }
        size += ops;
    }
    if start < op_counts.len() {
        groups.push(start..op_counts.len());
    }
    groups
}
