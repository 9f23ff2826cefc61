//! Per-thread ordered lists of connections, one per activity class.
//!
//! Every list is kept in least recently active first order: a connection
//! that does something is moved to the tail of its list. The timeout sweep
//! then only has to look at the head of each list, and can stop at the
//! first connection that hasn't expired. The keepalive list is the
//! exception: idle keepalive connections also expire on total connection
//! age, which is not in list order, so that list is scanned in full.
//!
//! The lists are intrusive and index based. Links live in a `Vec` with one
//! entry per connection slot, so nothing is allocated after startup.

const NIL: usize = usize::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Activity {
    /// TLS handshake in progress.
    Handshake,

    /// Reading a request, or writing a response.
    ReadWrite,

    /// Waiting for a worker or the delegate. No I/O expected.
    Processing,

    /// Idle between requests.
    Keepalive,
}

impl Activity {
    pub const ALL: [Activity; 4] = [
        Activity::Handshake,
        Activity::ReadWrite,
        Activity::Processing,
        Activity::Keepalive,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Activity::Handshake => "handshake",
            Activity::ReadWrite => "readwrite",
            Activity::Processing => "processing",
            Activity::Keepalive => "keepalive",
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Link {
    prev: usize,
    next: usize,
    list: Option<Activity>,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            prev: NIL,
            next: NIL,
            list: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct End {
    head: usize,
    tail: usize,
    len: usize,
}

#[derive(Debug)]
pub(crate) struct ActivityLists {
    links: Vec<Link>,
    ends: [End; 4],
}

impl ActivityLists {
    #[must_use]
    pub fn new(slots: usize) -> Self {
        Self {
            links: vec![Link::default(); slots],
            ends: [End {
                head: NIL,
                tail: NIL,
                len: 0,
            }; 4],
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn class_of(&self, slot: usize) -> Option<Activity> {
        self.links[slot].list
    }

    #[must_use]
    pub fn len(&self, class: Activity) -> usize {
        self.ends[class.index()].len
    }

    /// Least recently active connection of the class.
    #[must_use]
    pub fn front(&self, class: Activity) -> Option<usize> {
        let head = self.ends[class.index()].head;
        (head != NIL).then_some(head)
    }

    /// Unlink from whatever list the slot is on, if any.
    pub fn remove(&mut self, slot: usize) {
        let Some(class) = self.links[slot].list else {
            return;
        };
        let Link { prev, next, .. } = self.links[slot];
        let end = &mut self.ends[class.index()];
        if prev == NIL {
            end.head = next;
        } else {
            self.links[prev].next = next;
        }
        if next == NIL {
            end.tail = prev;
        } else {
            self.links[next].prev = prev;
        }
        end.len -= 1;
        self.links[slot] = Link::default();
    }

    /// Move to the tail of `class`, removing from any other list first.
    pub fn touch(&mut self, slot: usize, class: Activity) {
        self.remove(slot);
        let end = &mut self.ends[class.index()];
        let tail = end.tail;
        self.links[slot] = Link {
            prev: tail,
            next: NIL,
            list: Some(class),
        };
        if tail == NIL {
            end.head = slot;
        } else {
            self.links[tail].next = slot;
        }
        end.tail = slot;
        end.len += 1;
    }

    /// Slots in `class`, least recently active first.
    pub fn iter(&self, class: Activity) -> impl Iterator<Item = usize> + '_ {
        let mut cur = self.ends[class.index()].head;
        std::iter::from_fn(move || {
            if cur == NIL {
                return None;
            }
            let slot = cur;
            cur = self.links[slot].next;
            Some(slot)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(l: &ActivityLists, class: Activity) -> Vec<usize> {
        l.iter(class).collect()
    }

    #[test]
    fn touch_moves_to_tail() {
        let mut l = ActivityLists::new(5);
        for s in 0..4 {
            l.touch(s, Activity::ReadWrite);
        }
        assert_eq!(list(&l, Activity::ReadWrite), vec![0, 1, 2, 3]);
        l.touch(1, Activity::ReadWrite);
        assert_eq!(list(&l, Activity::ReadWrite), vec![0, 2, 3, 1]);
        l.touch(0, Activity::ReadWrite);
        assert_eq!(list(&l, Activity::ReadWrite), vec![2, 3, 1, 0]);
        assert_eq!(l.front(Activity::ReadWrite), Some(2));
        assert_eq!(l.len(Activity::ReadWrite), 4);
    }

    #[test]
    fn each_slot_on_one_list() {
        let mut l = ActivityLists::new(4);
        l.touch(0, Activity::Handshake);
        l.touch(1, Activity::Handshake);
        l.touch(0, Activity::Keepalive);
        assert_eq!(l.class_of(0), Some(Activity::Keepalive));
        assert_eq!(list(&l, Activity::Handshake), vec![1]);
        assert_eq!(list(&l, Activity::Keepalive), vec![0]);
        let total: usize = Activity::ALL.iter().map(|c| l.len(*c)).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn remove_head_middle_tail() {
        let mut l = ActivityLists::new(4);
        for s in 0..4 {
            l.touch(s, Activity::Processing);
        }
        l.remove(2);
        assert_eq!(list(&l, Activity::Processing), vec![0, 1, 3]);
        l.remove(0);
        assert_eq!(list(&l, Activity::Processing), vec![1, 3]);
        l.remove(3);
        assert_eq!(list(&l, Activity::Processing), vec![1]);
        l.remove(1);
        assert_eq!(l.front(Activity::Processing), None);
        assert_eq!(l.len(Activity::Processing), 0);
        // Removing something not on a list is a no-op.
        l.remove(1);
        assert_eq!(l.class_of(1), None);
    }
}
