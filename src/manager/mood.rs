//! Component mood transitions

use crate::error::ComponentError;
use crate::state::Mood;

/// Something that happened to a component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoodEvent {
    /// The worker acknowledged creating the job
    JobCreated,
    /// The component logged in reporting this mood
    LoggedIn(Mood),
    /// The pipeline reported a new mood
    Reported(Mood),
    /// The avatar went away
    Disconnected { stop_in_flight: bool },
    /// An admin stopped a component that has no avatar
    StopRequested,
}

/// Mood after `event`, or `None` when the event does not apply in `from`
pub fn transition(from: Mood, event: MoodEvent) -> Option<Mood> {
    use Mood::*;
    match event {
        MoodEvent::JobCreated => (from == Sleeping).then_some(Waking),
        MoodEvent::LoggedIn(reported) => Some(match reported {
            Happy | Hungry | Sad => reported,
            Waking | Sleeping | Lost => Hungry,
        }),
        MoodEvent::Reported(reported) => match (from, reported) {
            (Hungry | Happy | Sad, Happy) => Some(Happy),
            (Happy | Hungry | Sad, Hungry) => Some(Hungry),
            (Happy | Hungry | Waking, Sad) => Some(Sad),
            (_, reported) if reported == from => Some(from),
            _ => None,
        },
        MoodEvent::Disconnected { stop_in_flight } => {
            Some(if stop_in_flight { Sleeping } else { Lost })
        }
        MoodEvent::StopRequested => matches!(from, Sad | Lost).then_some(Sleeping),
    }
}

/// Check that a component may be started
pub fn check_start(
    id: &str,
    mood: Mood,
    pending: Option<Mood>,
    has_avatar: bool,
    worker: Option<&str>,
    worker_logged_in: bool,
) -> Result<(), ComponentError> {
    if mood != Mood::Sleeping {
        return Err(if has_avatar {
            ComponentError::AlreadyRunning(id.to_string())
        } else {
            ComponentError::Mood {
                id: id.to_string(),
                mood,
            }
        });
    }
    if let Some(pending) = pending {
        return Err(ComponentError::Busy {
            id: id.to_string(),
            pending,
        });
    }
    if !worker_logged_in {
        return Err(ComponentError::NoWorker {
            id: id.to_string(),
            worker: worker.unwrap_or_default().to_string(),
        });
    }
    Ok(())
}

/// Check that a component may be deleted
pub fn check_delete(id: &str, mood: Mood, pending: Option<Mood>) -> Result<(), ComponentError> {
    if let Some(pending) = pending {
        return Err(ComponentError::Busy {
            id: id.to_string(),
            pending,
        });
    }
    if mood != Mood::Sleeping {
        return Err(ComponentError::Mood {
            id: id.to_string(),
            mood,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use Mood::*;

    #[test]
    fn test_lifecycle() {
        let mood = transition(Sleeping, MoodEvent::JobCreated).unwrap();
        assert_eq!(mood, Waking);
        let mood = transition(mood, MoodEvent::LoggedIn(Waking)).unwrap();
        assert_eq!(mood, Hungry);
        let mood = transition(mood, MoodEvent::Reported(Happy)).unwrap();
        assert_eq!(mood, Happy);
        let mood = transition(mood, MoodEvent::Reported(Hungry)).unwrap();
        assert_eq!(mood, Hungry);
        let mood = transition(mood, MoodEvent::Reported(Sad)).unwrap();
        assert_eq!(mood, Sad);
    }

    #[test]
    fn test_disconnect_depends_on_stop() {
        assert_eq!(
            transition(Happy, MoodEvent::Disconnected { stop_in_flight: false }),
            Some(Lost)
        );
        assert_eq!(
            transition(Happy, MoodEvent::Disconnected { stop_in_flight: true }),
            Some(Sleeping)
        );
    }

    #[test]
    fn test_stop_without_avatar() {
        assert_eq!(transition(Lost, MoodEvent::StopRequested), Some(Sleeping));
        assert_eq!(transition(Sad, MoodEvent::StopRequested), Some(Sleeping));
        assert_eq!(transition(Waking, MoodEvent::StopRequested), None);
    }

    #[test]
    fn test_reconnect_lands_hungry() {
        assert_eq!(transition(Lost, MoodEvent::LoggedIn(Lost)), Some(Hungry));
        assert_eq!(transition(Lost, MoodEvent::LoggedIn(Happy)), Some(Happy));
        assert_eq!(transition(Sleeping, MoodEvent::JobCreated), Some(Waking));
        assert_eq!(transition(Happy, MoodEvent::JobCreated), None);
    }

    #[test]
    fn test_check_start() {
        assert!(check_start("/f/c", Sleeping, None, false, Some("w1"), true).is_ok());
        assert_eq!(
            check_start("/f/c", Happy, None, true, Some("w1"), true).unwrap_err(),
            ComponentError::AlreadyRunning("/f/c".into())
        );
        assert!(matches!(
            check_start("/f/c", Lost, None, false, Some("w1"), true),
            Err(ComponentError::Mood { mood: Lost, .. })
        ));
        assert!(matches!(
            check_start("/f/c", Sleeping, Some(Happy), false, Some("w1"), true),
            Err(ComponentError::Busy { .. })
        ));
        assert!(matches!(
            check_start("/f/c", Sleeping, None, false, Some("w9"), false),
            Err(ComponentError::NoWorker { .. })
        ));
    }

    #[test]
    fn test_check_delete() {
        assert!(check_delete("/f/c", Sleeping, None).is_ok());
        assert!(check_delete("/f/c", Happy, None).is_err());
        assert!(check_delete("/f/c", Sleeping, Some(Happy)).is_err());
    }
}
