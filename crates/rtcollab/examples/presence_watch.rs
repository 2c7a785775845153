use rtcollab::{CollabConfig, CollaborationRoom, ResourceIdentity, ResourceType};
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // COLLAB_BASE_URL, COLLAB_HEARTBEAT_INTERVAL_SECS, ...
    let config = CollabConfig::from_env()?;

    let workspace_id = env::var("WORKSPACE_ID").unwrap_or_else(|_| "demo".to_string());
    let resource_type: ResourceType = env::var("RESOURCE_TYPE")
        .unwrap_or_else(|_| "page".to_string())
        .parse()?;
    let resource_id = env::var("RESOURCE_ID").unwrap_or_else(|_| "welcome".to_string());
    let token = env::var("COLLAB_TOKEN").unwrap_or_default();
    let user_id = env::var("USER_ID").unwrap_or_else(|_| "presence-watch".to_string());

    info!("Starting presence watcher against {}", config.base_url);

    let room = CollaborationRoom::new(config, user_id);
    room.on_content_change(|event| {
        info!(
            "Content change from {:?}: {} edit(s)",
            event.user_name,
            event.changes.as_ref().map_or(0, Vec::len)
        );
    });
    room.on_save(|event| info!("Content saved at version {:?}", event.version));

    let identity = ResourceIdentity::new(workspace_id, resource_type, resource_id);
    room.join(identity.clone(), &token).await?;
    info!("Watching {}", identity);

    let mut presence = room.presence().subscribe();
    loop {
        tokio::select! {
            changed = presence.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = room.view();
                let names: Vec<_> = view
                    .active_users_list
                    .iter()
                    .map(|user| user.user_name.as_str())
                    .collect();
                let typing: Vec<_> = view
                    .typing_users
                    .iter()
                    .map(|user| user.user_name.as_str())
                    .collect();
                info!("Present: {:?} typing: {:?}", names, typing);
                if let Some(error) = view.error {
                    warn!("Room error: {}", error);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    room.leave();
    Ok(())
}
