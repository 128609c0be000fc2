use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::remote::cloud::{CloudList, CloudListItem};
use crate::remote::{CloudClient, Service};
use crate::storage::models::{List, ListItem};
use crate::storage::settings::{self, MergeFlag};
use crate::storage::{repository, BatchOp};
use crate::sync::rate_limit::retry_remote;
use crate::sync::{apply_ops, family_failed, SyncContext};

const FAMILY: &str = "Cloud lists";

/// Local lists with the ids of their items.
type LocalLists = HashMap<String, (List, HashSet<String>)>;

pub struct ListReconciler<'a> {
    ctx: &'a SyncContext,
    cloud: &'a dyn CloudClient,
}

impl<'a> ListReconciler<'a> {
    pub fn new(ctx: &'a SyncContext, cloud: &'a dyn CloudClient) -> Self {
        Self { ctx, cloud }
    }

    pub async fn sync(&self) -> Result<bool> {
        let has_merged = self
            .ctx
            .db
            .reader()
            .call(|conn| settings::is_merged(conn, MergeFlag::CloudLists))
            .await?;

        if !self.download(has_merged).await? {
            return Ok(false);
        }
        if has_merged {
            return self.prune_removed().await;
        }
        if !self.upload_all().await? {
            return Ok(false);
        }
        self.ctx
            .db
            .writer()
            .call(|conn| settings::set_merged(conn, MergeFlag::CloudLists, true))
            .await?;
        log::info!("Lists merged with the Cloud");
        Ok(true)
    }

    /// Insert unknown lists and item additions. Outside the first merge
    /// known lists also take the remote name and order, and items missing
    /// remotely are deleted.
    pub async fn download(&self, has_merged: bool) -> Result<bool> {
        let mut local = self.load_local().await?;

        let mut page_cursor: Option<String> = None;
        loop {
            self.ctx.check_continue()?;
            let page = match retry_remote!(Service::Cloud, self.cloud.lists(page_cursor.clone())) {
                Ok(page) => page,
                Err(e) => return family_failed(self.ctx, FAMILY, e),
            };

            let mut ops = Vec::new();
            for remote in &page.items {
                list_ops(&mut local, remote, has_merged, &mut ops);
            }
            apply_ops(&self.ctx.db, FAMILY, ops).await?;

            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }
        Ok(true)
    }

    /// Delete local lists the Cloud no longer has. Never runs with one or
    /// zero local lists and never deletes them all.
    pub async fn prune_removed(&self) -> Result<bool> {
        let local = self
            .ctx
            .db
            .reader()
            .call(|conn| repository::all_lists(conn))
            .await?;
        if local.len() <= 1 {
            return Ok(true);
        }

        let mut remote_ids = HashSet::new();
        let mut page_cursor: Option<String> = None;
        loop {
            self.ctx.check_continue()?;
            let page = match retry_remote!(Service::Cloud, self.cloud.list_ids(page_cursor.clone()))
            {
                Ok(page) => page,
                Err(e) => return family_failed(self.ctx, FAMILY, e),
            };
            remote_ids.extend(page.items);
            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }

        let ops = prune_ops(&local, &remote_ids);
        if !ops.is_empty() {
            log::info!("Removing {} lists deleted from the Cloud", ops.len());
        }
        apply_ops(&self.ctx.db, FAMILY, ops).await?;
        Ok(true)
    }

    pub async fn upload_all(&self) -> Result<bool> {
        let local = self.load_local().await?;
        let mut payload: Vec<CloudList> = local
            .into_values()
            .map(|(list, item_ids)| {
                let mut items: Vec<CloudListItem> = item_ids
                    .into_iter()
                    .map(|list_item_id| CloudListItem { list_item_id })
                    .collect();
                items.sort_by(|a, b| a.list_item_id.cmp(&b.list_item_id));
                CloudList {
                    list_id: list.list_id,
                    name: list.name,
                    order: Some(list.sort_order),
                    items,
                }
            })
            .collect();
        if payload.is_empty() {
            return Ok(true);
        }
        payload.sort_by_key(|l| l.order);

        self.ctx.check_continue()?;
        let count = payload.len();
        if let Err(e) = retry_remote!(Service::Cloud, self.cloud.save_lists(payload.clone())) {
            return family_failed(self.ctx, FAMILY, e);
        }
        log::info!("Uploaded {count} lists to the Cloud");
        Ok(true)
    }

    async fn load_local(&self) -> Result<LocalLists> {
        Ok(self
            .ctx
            .db
            .reader()
            .call(|conn| {
                let mut local = LocalLists::new();
                for list in repository::all_lists(conn)? {
                    let items = repository::list_item_ids(conn, &list.list_id)?;
                    local.insert(list.list_id.clone(), (list, items));
                }
                Ok::<_, rusqlite::Error>(local)
            })
            .await?)
    }
}

/// Ops for one remote list. `local` is updated so later pages see the
/// result.
fn list_ops(local: &mut LocalLists, remote: &CloudList, has_merged: bool, ops: &mut Vec<BatchOp>) {
    let remote_items: Vec<ListItem> = remote
        .items
        .iter()
        .filter_map(|item| {
            let parsed = ListItem::parse(&item.list_item_id);
            if parsed.is_none() {
                log::warn!("Skipping malformed list item id {}", item.list_item_id);
            }
            parsed
        })
        .filter(|item| item.list_id == remote.list_id)
        .collect();

    let Some((list, item_ids)) = local.get_mut(&remote.list_id) else {
        let list = List {
            list_id: remote.list_id.clone(),
            name: remote.name.clone(),
            sort_order: remote.order.unwrap_or(0),
        };
        ops.push(BatchOp::InsertList { list: list.clone() });
        let mut item_ids = HashSet::new();
        for item in remote_items {
            item_ids.insert(item.list_item_id.clone());
            ops.push(BatchOp::InsertListItem { item });
        }
        local.insert(remote.list_id.clone(), (list, item_ids));
        return;
    };

    if has_merged {
        let sort_order = remote.order.unwrap_or(list.sort_order);
        if list.name != remote.name || list.sort_order != sort_order {
            list.name = remote.name.clone();
            list.sort_order = sort_order;
            ops.push(BatchOp::UpdateList {
                list_id: list.list_id.clone(),
                name: list.name.clone(),
                sort_order,
            });
        }
    }

    let remote_ids: HashSet<&str> = remote_items.iter().map(|i| i.list_item_id.as_str()).collect();
    if has_merged {
        let mut removed: Vec<String> = item_ids
            .iter()
            .filter(|id| !remote_ids.contains(id.as_str()))
            .cloned()
            .collect();
        removed.sort();
        for list_item_id in removed {
            item_ids.remove(&list_item_id);
            ops.push(BatchOp::DeleteListItem { list_item_id });
        }
    }
    for item in remote_items {
        if item_ids.insert(item.list_item_id.clone()) {
            ops.push(BatchOp::InsertListItem { item });
        }
    }
}

/// `local` is ordered by sort order; if every list would go the first one
/// is kept.
fn prune_ops(local: &[List], remote_ids: &HashSet<String>) -> Vec<BatchOp> {
    if local.len() <= 1 {
        return Vec::new();
    }
    let mut doomed: Vec<&List> = local
        .iter()
        .filter(|l| !remote_ids.contains(&l.list_id))
        .collect();
    if doomed.len() == local.len() {
        doomed.remove(0);
    }
    doomed
        .into_iter()
        .map(|l| BatchOp::DeleteList {
            list_id: l.list_id.clone(),
        })
        .collect()
}
