use super::*;
use link::{Contact, LinkError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// The identity triple a link name is bound to across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousLink {
    pub nexthop: String,
    pub link_type: LinkType,
    pub cl_name: String,
    pub remote_eid: Eid,
}

/// Opportunistic link names wrap their counter at 10^8.
const OPPORTUNISTIC_WRAP: u64 = 100_000_000;

#[derive(Default)]
struct Inner {
    links: HashMap<String, Link>,
    previous_links: HashMap<String, PreviousLink>,
    availability_timers: HashMap<String, CancellationToken>,
    cl_defaults: HashMap<String, Vec<(String, String)>>,
    opportunistic_counter: u64,
}

/// The registry of configured links and their availability timers.
///
/// The inner lock guards the two link sets and the timer map. It is only
/// ever held within one handler call; timer callbacks re-enter through the
/// event queue rather than the lock, so a timer firing can never deadlock
/// against a handler posting events.
pub struct ContactManager {
    inner: Mutex<Inner>,
    events: event::EventTx,
    shutting_down: AtomicBool,
}

impl ContactManager {
    pub fn new(events: event::EventTx) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            events,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Seeds the previous-link set from persistent storage, preserving
    /// forwarding-log name semantics across restarts.
    pub fn load_previous_links(&self, previous: impl IntoIterator<Item = (String, PreviousLink)>) {
        let mut inner = self.inner.lock().unwrap();
        inner.previous_links.extend(previous);
    }

    /// Registers a new link.
    ///
    /// Rejected if the name is already configured, or if the name was used
    /// before for a different (next-hop, type, convergence-layer) triple —
    /// except that OPPORTUNISTIC links may reuse a previous name when the
    /// remote EID matches. A consistent previous link reincarnates the new
    /// one: its remote EID is inherited and the reincarnation flag set so
    /// persistent storage updates instead of inserting.
    pub fn add_new_link(&self, mut link: Link) -> Result<(), LinkError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(LinkError::ShuttingDown);
        }
        let name = link.name().to_string();
        let mut inner = self.inner.lock().unwrap();

        if inner.links.contains_key(&name) {
            return Err(LinkError::Exists(name));
        }

        if let Some(prev) = inner.previous_links.get(&name) {
            let same_triple = prev.nexthop == link.nexthop()
                && prev.link_type == link.link_type()
                && prev.cl_name == link.cl_name();
            let opportunistic_match = link.link_type() == LinkType::Opportunistic
                && prev.remote_eid == link.remote_eid;
            if !(same_triple || opportunistic_match) {
                return Err(LinkError::InconsistentWithPrevious(name));
            }
            debug!("link {name} reincarnates a previous link");
            if link.remote_eid.is_null() {
                link.remote_eid = prev.remote_eid.clone();
            }
            link.reincarnated = true;
        }

        if let Some(defaults) = inner.cl_defaults.get(link.cl_name()) {
            for (option, value) in defaults.clone() {
                link.params.set(&option, &value)?;
            }
        }

        inner.links.insert(name.clone(), link);
        drop(inner);
        let _ = self.events.send(LinkEvent::LinkCreated { name });
        Ok(())
    }

    /// Allocates a fresh opportunistic link name `<base>-<n>`, skipping
    /// collisions with current and previous names.
    pub fn new_opportunistic_name(&self, base: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let n = inner.opportunistic_counter;
            inner.opportunistic_counter = (n + 1) % OPPORTUNISTIC_WRAP;
            let name = format!("{base}-{n}");
            if !inner.links.contains_key(&name) && !inner.previous_links.contains_key(&name) {
                return name;
            }
        }
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.inner.lock().unwrap().links.contains_key(name)
    }

    pub fn link_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().links.keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs `f` with shared access to the named link.
    pub fn find_link<T>(&self, name: &str, f: impl FnOnce(&Link) -> T) -> Result<T, LinkError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(LinkError::ShuttingDown);
        }
        let inner = self.inner.lock().unwrap();
        inner
            .links
            .get(name)
            .map(f)
            .ok_or_else(|| LinkError::Unknown(name.to_string()))
    }

    /// Runs `f` with exclusive access to the named link.
    pub fn with_link_mut<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Link) -> T,
    ) -> Result<T, LinkError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .links
            .get_mut(name)
            .map(f)
            .ok_or_else(|| LinkError::Unknown(name.to_string()))
    }

    /// Removes a link, cancelling its availability timer. If the
    /// forwarding log used it (and it is not itself a reincarnation that
    /// is already recorded), the name moves to the previous-link set.
    pub fn del_link(&self, name: &str) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut link) = inner.links.remove(name) else {
            return Err(LinkError::Unknown(name.to_string()));
        };
        link.deleted = true;

        if let Some(timer) = inner.availability_timers.remove(name) {
            timer.cancel();
        }
        if link.used_in_fwdlog && !link.reincarnated {
            inner.previous_links.insert(
                name.to_string(),
                PreviousLink {
                    nexthop: link.nexthop().to_string(),
                    link_type: link.link_type(),
                    cl_name: link.cl_name().to_string(),
                    remote_eid: link.remote_eid.clone(),
                },
            );
        }
        drop(inner);
        let _ = self.events.send(LinkEvent::LinkDeleted {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Requests that a closed or unavailable link be opened again.
    pub fn reopen_link(&self, name: &str) -> Result<(), LinkError> {
        self.with_link_mut(name, |link| {
            link.retry_interval = link.params.min_retry_interval;
            link.state = LinkState::Available;
            link.stats.contact_attempts += 1;
        })?;
        let _ = self.events.send(LinkEvent::OpenRequested {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn handle_link_available(&self, name: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.availability_timers.remove(name) {
            timer.cancel();
        }
        if let Some(link) = inner.links.get_mut(name) {
            if link.state == LinkState::Unavailable {
                link.state = LinkState::Available;
            }
        }
    }

    /// Handles LinkUnavailable: for ALWAYSON/ONDEMAND links whose contact
    /// broke (reason other than USER or IDLE), arms the availability timer
    /// at the current retry interval and doubles it, capped at
    /// `max_retry_interval`. Returns the delay armed, if any.
    pub fn handle_link_unavailable(
        self: &Arc<Self>,
        name: &str,
        reason: ContactReason,
    ) -> Option<u32> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let link = match inner.links.get_mut(name) {
            Some(link) if !link.deleted => link,
            _ => {
                warn!("link unavailable for unknown or deleted link {name}");
                return None;
            }
        };

        link.state = LinkState::Unavailable;
        link.contact = None;

        if !matches!(
            link.link_type(),
            LinkType::AlwaysOn | LinkType::OnDemand
        ) {
            return None;
        }
        if !reason.is_retryable() {
            debug!("link {name} unavailable ({reason:?}): no retry");
            return None;
        }

        if link.retry_interval == 0 {
            link.retry_interval = link.params.min_retry_interval;
        }
        let timeout = link.retry_interval;
        link.retry_interval = (link.retry_interval * 2).min(link.params.max_retry_interval);

        debug!("link {name} unavailable ({reason:?}): retry in {timeout}s");

        // The timer re-enters via the event queue; the manager lock is
        // never held across the sleep.
        let token = CancellationToken::new();
        if let Some(old) = inner
            .availability_timers
            .insert(name.to_string(), token.clone())
        {
            old.cancel();
        }
        drop(inner);

        let manager = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(std::time::Duration::from_secs(timeout as u64)) => {
                    manager.availability_timer_fired(&name);
                }
            }
        });
        Some(timeout)
    }

    fn availability_timer_fired(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.availability_timers.remove(name);
        let still_unavailable = inner
            .links
            .get(name)
            .is_some_and(|l| l.state == LinkState::Unavailable && !l.deleted);
        drop(inner);
        if still_unavailable {
            let _ = self.events.send(LinkEvent::OpenRequested {
                name: name.to_string(),
            });
        }
    }

    /// Handles ContactUp: records the contact and resets the retry
    /// interval for ALWAYSON/ONDEMAND links.
    pub fn handle_contact_up(&self, name: &str, contact: Contact) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let Some(link) = inner.links.get_mut(name) else {
            warn!("contact up for unknown link {name}");
            return;
        };
        if link.deleted {
            warn!("contact up for deleted link {name}");
            return;
        }
        link.state = LinkState::Open;
        link.contact = Some(contact);
        link.stats.contacts += 1;
        if matches!(
            link.link_type(),
            LinkType::AlwaysOn | LinkType::OnDemand
        ) {
            link.retry_interval = link.params.min_retry_interval;
        }
    }

    /// Fails fast all new-link/find-link operations and cancels every
    /// armed timer.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        for (_, timer) in inner.availability_timers.drain() {
            timer.cancel();
        }
    }

    pub fn set_cl_defaults(&self, cl_name: &str, options: Vec<(String, String)>) {
        let mut inner = self.inner.lock().unwrap();
        inner.cl_defaults.insert(cl_name.to_string(), options);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<ContactManager>, event::EventRx) {
        let (tx, rx) = event::channel();
        (ContactManager::new(tx), rx)
    }

    fn link(name: &str, link_type: LinkType) -> Link {
        Link::new(name, "10.0.0.2:4556", link_type, "stream")
    }

    #[test]
    fn duplicate_names_rejected() {
        let (mgr, _rx) = manager();
        mgr.add_new_link(link("l1", LinkType::AlwaysOn)).unwrap();
        assert!(matches!(
            mgr.add_new_link(link("l1", LinkType::AlwaysOn)),
            Err(LinkError::Exists(_))
        ));
    }

    #[test]
    fn previous_usage_must_be_consistent() {
        let (mgr, _rx) = manager();
        mgr.load_previous_links([(
            "l1".to_string(),
            PreviousLink {
                nexthop: "10.0.0.2:4556".to_string(),
                link_type: LinkType::AlwaysOn,
                cl_name: "stream".to_string(),
                remote_eid: "dtn://peer/".parse().unwrap(),
            },
        )]);

        // Same triple reincarnates, inheriting the remote EID
        mgr.add_new_link(link("l1", LinkType::AlwaysOn)).unwrap();
        mgr.find_link("l1", |l| {
            assert!(l.reincarnated);
            assert_eq!(l.remote_eid, "dtn://peer/".parse().unwrap());
        })
        .unwrap();

        // A different triple under the same name is rejected
        assert!(matches!(
            mgr.add_new_link(link("l2", LinkType::OnDemand)),
            Ok(())
        ));
        mgr.del_link("l1").unwrap();
        assert!(matches!(
            mgr.add_new_link(link("l1", LinkType::OnDemand)),
            Err(LinkError::InconsistentWithPrevious(_))
        ));

        // ...unless it is opportunistic with a matching remote EID
        let mut opp = link("l1", LinkType::Opportunistic);
        opp.remote_eid = "dtn://peer/".parse().unwrap();
        mgr.add_new_link(opp).unwrap();
    }

    #[test]
    fn opportunistic_names_skip_collisions() {
        let (mgr, _rx) = manager();
        mgr.add_new_link(link("opp-0", LinkType::AlwaysOn)).unwrap();
        assert_eq!(mgr.new_opportunistic_name("opp"), "opp-1");
        assert_eq!(mgr.new_opportunistic_name("opp"), "opp-2");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backoff_doubles_and_caps() {
        let (mgr, mut rx) = manager();
        let mut l = link("l1", LinkType::AlwaysOn);
        l.params.min_retry_interval = 1;
        l.params.max_retry_interval = 8;
        mgr.add_new_link(l).unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::LinkCreated { name: "l1".into() }));

        // Five consecutive BROKEN events arm timers of 1, 2, 4, 8, 8 s
        let mut delays = Vec::new();
        for _ in 0..5 {
            delays.push(
                mgr.handle_link_unavailable("l1", ContactReason::Broken)
                    .unwrap(),
            );
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 8]);

        // ContactUp resets to the minimum
        mgr.handle_contact_up(
            "l1",
            Contact {
                start: time::OffsetDateTime::UNIX_EPOCH,
                duration: std::time::Duration::from_secs(60),
            },
        );
        assert_eq!(
            mgr.handle_link_unavailable("l1", ContactReason::Broken),
            Some(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timer_posts_open_request_unless_link_left_unavailable() {
        let (mgr, mut rx) = manager();
        let mut l = link("l1", LinkType::OnDemand);
        l.params.min_retry_interval = 1;
        mgr.add_new_link(l).unwrap();
        assert!(matches!(rx.recv().await, Some(LinkEvent::LinkCreated { .. })));

        mgr.handle_link_unavailable("l1", ContactReason::Broken)
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::OpenRequested { name: "l1".into() })
        );

        // A link that became available before the timer fires is left alone
        mgr.handle_link_unavailable("l1", ContactReason::Broken)
            .unwrap();
        mgr.handle_link_available("l1");
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn user_and_idle_closures_do_not_retry() {
        let (tx, _rx) = event::channel();
        let mgr = ContactManager::new(tx);
        let mut l = link("l1", LinkType::AlwaysOn);
        l.params.min_retry_interval = 1;
        mgr.add_new_link(l).unwrap();

        assert_eq!(mgr.handle_link_unavailable("l1", ContactReason::User), None);
        assert_eq!(mgr.handle_link_unavailable("l1", ContactReason::Idle), None);
        // Scheduled links never arm the retry timer
        mgr.add_new_link(link("l2", LinkType::Scheduled)).unwrap();
        assert_eq!(
            mgr.handle_link_unavailable("l2", ContactReason::Broken),
            None
        );
    }

    #[test]
    fn shutdown_fails_fast() {
        let (mgr, _rx) = manager();
        mgr.add_new_link(link("l1", LinkType::AlwaysOn)).unwrap();
        mgr.shutdown();
        assert!(matches!(
            mgr.add_new_link(link("l2", LinkType::AlwaysOn)),
            Err(LinkError::ShuttingDown)
        ));
        assert!(matches!(
            mgr.find_link("l1", |_| ()),
            Err(LinkError::ShuttingDown)
        ));
    }
}
