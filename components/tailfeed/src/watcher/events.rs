// Local crates
use crate::watcher::models::WatcherEvent;

// External crates
use notify::{
    Event, EventKind,
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
};

/// Translate raw notify events from the watched directories into
/// `WatcherEvent`s. Creates and move-ins appear; removes and move-outs
/// disappear; data writes become wakes. Everything else is ignored.
pub fn translate_event(event: Event) -> Vec<WatcherEvent> {
    let mut out = Vec::new();

    match event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => {
            for path in event.paths {
                out.push(WatcherEvent::FileAppeared(path));
            }
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in event.paths {
                out.push(WatcherEvent::FileAppeared(path));
            }
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in event.paths {
                out.push(WatcherEvent::FileRemoved(path));
            }
        }

        // Rename observed with both endpoints inside watched directories:
        // the old path leaves tracking, the new one enters it.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.len() == 2 {
                out.push(WatcherEvent::FileRemoved(event.paths[0].clone()));
                out.push(WatcherEvent::FileAppeared(event.paths[1].clone()));
            }
        }

        EventKind::Remove(RemoveKind::File | RemoveKind::Any) => {
            for path in event.paths {
                out.push(WatcherEvent::FileRemoved(path));
            }
        }

        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
            for path in event.paths {
                out.push(WatcherEvent::FileModified(path));
            }
        }

        other => {
            tracing::trace!(kind = ?other, "Ignoring filesystem event");
        }
    }

    out
}
