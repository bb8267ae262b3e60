//! Document command handlers
//!
//! Each command joins a room on the sync server as a short-lived client.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::warn;

use diffsync_core::{Document, SyncClient, SyncEvent, WsTransport};

use crate::output::Output;

async fn connect(url: &str, room: &str) -> Result<SyncClient<WsTransport>> {
    let transport = WsTransport::connect(url)
        .await
        .with_context(|| format!("Failed to connect to sync server at {}", url))?;
    Ok(SyncClient::new(transport, room))
}

async fn join(client: &Arc<SyncClient<WsTransport>>) -> Result<()> {
    client
        .initialize()
        .await
        .with_context(|| format!("Failed to join room '{}'", client.room()))
}

/// Print a room's document
pub async fn show(url: &str, room: &str, output: &Output) -> Result<()> {
    let client = Arc::new(connect(url, room).await?);
    join(&client).await?;

    output.print_document(room, &client.document().await?);
    client.transport().close().await;
    Ok(())
}

/// Set the value at a JSON pointer and sync it
pub async fn set(url: &str, room: &str, pointer: &str, value: &str, output: &Output) -> Result<()> {
    let value: Document =
        serde_json::from_str(value).with_context(|| format!("Invalid JSON value: {}", value))?;

    edit(url, room, output, |doc| set_pointer(doc, pointer, value)).await?;
    output.success(&format!("Set {}", display_pointer(pointer)));
    Ok(())
}

/// Remove the value at a JSON pointer and sync it
pub async fn remove(url: &str, room: &str, pointer: &str, output: &Output) -> Result<()> {
    edit(url, room, output, |doc| remove_pointer(doc, pointer).map(|_| ())).await?;
    output.success(&format!("Removed {}", display_pointer(pointer)));
    Ok(())
}

/// Print the document, then again after every remote change
pub async fn watch(url: &str, room: &str, output: &Output) -> Result<()> {
    let mut client = connect(url, room).await?;
    let Some(mut events) = client.take_events() else {
        bail!("Event stream unavailable");
    };
    let client = Arc::new(client);
    join(&client).await?;

    output.print_document(room, &client.document().await?);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SyncEvent::DocumentUpdated) => {
                    output.print_document(room, &client.document().await?);
                }
                Some(SyncEvent::Error(message)) => warn!("Sync failed: {}", message),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.transport().close().await;
    Ok(())
}

/// Join, mutate the working copy, sync once and print the result
async fn edit<F>(url: &str, room: &str, output: &Output, mutate: F) -> Result<()>
where
    F: FnOnce(&mut Document) -> Result<()>,
{
    let client = Arc::new(connect(url, room).await?);
    join(&client).await?;

    let mut outcome = Ok(());
    client
        .update(|doc| outcome = mutate(doc))
        .await
        .context("Failed to sync change")?;
    outcome?;

    output.print_document(room, &client.document().await?);
    client.transport().close().await;
    Ok(())
}

/// Set `value` at `pointer`, creating the final object key or array slot
///
/// `-` as the last token appends to an array. The empty pointer replaces
/// the whole document.
pub fn set_pointer(doc: &mut Document, pointer: &str, value: Document) -> Result<()> {
    let Some((parent, token)) = split_pointer(pointer)? else {
        *doc = value;
        return Ok(());
    };

    let Some(target) = doc.pointer_mut(parent) else {
        bail!("Nothing at {}", display_pointer(parent));
    };

    match target {
        Document::Object(map) => {
            map.insert(token, value);
        }
        Document::Array(items) => {
            let index = if token == "-" {
                items.len()
            } else {
                parse_index(&token)?
            };
            match index.cmp(&items.len()) {
                std::cmp::Ordering::Less => items[index] = value,
                std::cmp::Ordering::Equal => items.push(value),
                std::cmp::Ordering::Greater => {
                    bail!("Index {} is past the end of {}", index, display_pointer(parent))
                }
            }
        }
        _ => bail!("{} is not an object or array", display_pointer(parent)),
    }
    Ok(())
}

/// Remove and return the value at `pointer`
pub fn remove_pointer(doc: &mut Document, pointer: &str) -> Result<Document> {
    let Some((parent, token)) = split_pointer(pointer)? else {
        bail!("Cannot remove the whole document");
    };

    let removed = match doc.pointer_mut(parent) {
        Some(Document::Object(map)) => map.remove(&token),
        Some(Document::Array(items)) => {
            let index = parse_index(&token)?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    };

    removed.with_context(|| format!("Nothing at {}", display_pointer(pointer)))
}

/// Split a JSON pointer into its parent pointer and unescaped last token
///
/// Returns `None` for the empty pointer.
fn split_pointer(pointer: &str) -> Result<Option<(&str, String)>> {
    if pointer.is_empty() {
        return Ok(None);
    }
    if !pointer.starts_with('/') {
        bail!("Invalid JSON pointer '{}': must start with '/'", pointer);
    }

    let (parent, token) = pointer
        .rsplit_once('/')
        .context("Invalid JSON pointer")?;
    Ok(Some((parent, token.replace("~1", "/").replace("~0", "~"))))
}

fn parse_index(token: &str) -> Result<usize> {
    token
        .parse()
        .with_context(|| format!("Invalid array index '{}'", token))
}

fn display_pointer(pointer: &str) -> &str {
    if pointer.is_empty() {
        "the document root"
    } else {
        pointer
    }
}
