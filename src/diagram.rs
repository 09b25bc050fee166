//! Diagram layout.
//!
//! Pass 1 walks lines of time top to bottom: each line is derived from the
//! previous one by asking every surviving path what it wants to do next.
//! Link events (fork, reap, kill pairs) connect two paths horizontally and
//! need synchronization: reaps wait for the child to be ready to die, kill
//! pairs rendezvous through the paths' `kill_partner` pointers, and only
//! one horizontal line is allowed per diagram line (later links defer).
//!
//! Pass 2 packs paths into lanes like falling Tetris pieces: children are
//! dropped from the top and come to rest in the first lane where their
//! [start, end] interval doesn't overlap anyone, processed in reverse fork
//! order so later forks land further right.
//!
//! Pass 3 hands the lines to the [`Drawer`] for column-exact rendering.

use std::collections::HashMap;

use crate::event::EventKind;
use crate::process::{ProcessId, ProcessTree};
use crate::render::{Colour, Drawer, EventRenderer, Grid};

/// Which events appear on the diagram.
#[derive(Clone, Copy, Debug)]
pub struct DiagramOpts {
    pub show_execs: bool,
    pub show_failed_execs: bool,
    pub show_non_fatal_signals: bool,
    pub show_signal_sends: bool,
    pub lane_width: usize,
}

impl Default for DiagramOpts {
    fn default() -> Self {
        Self {
            show_execs: true,
            show_failed_execs: false,
            show_non_fatal_signals: false,
            show_signal_sends: true,
            lane_width: 4,
        }
    }
}

/// Where a process sits on the diagram. Lines are counted from 0; -1 means
/// "not decided yet".
#[derive(Clone, Copy, Debug)]
struct Path {
    start_line: isize,
    end_line: isize,
    lane: isize,

    /// Kill-pair rendezvous: when a path's next visible event is one half
    /// of a kill, this points at the peer so the other path knows both
    /// sides are ready to draw the line.
    kill_partner: Option<ProcessId>,
}

impl Path {
    fn new(start_line: isize) -> Self {
        Self {
            start_line,
            end_line: -1,
            lane: -1,
            kill_partner: None,
        }
    }
}

/// One point of a process's lifecycle on one line. `event` is the event
/// drawn at this point (if any); `next` indexes the first not-yet-consumed
/// visible event.
#[derive(Clone, Copy, Debug)]
struct Node {
    process: ProcessId,
    event: Option<usize>,
    next: Option<usize>,
}

pub struct Diagram {
    lines: usize,
    lanes: usize,
    truncated: bool,
    grid: Grid,
    paths: HashMap<ProcessId, Path>,
}

impl Diagram {
    /// Build and render the diagram for the tree rooted at `leader`.
    pub fn new(tree: &ProcessTree, leader: ProcessId, opts: DiagramOpts) -> Self {
        let mut builder = Builder {
            tree,
            opts,
            leader,
            paths: HashMap::new(),
            lines: Vec::new(),
        };
        builder.paths.insert(leader, Path::new(0));
        let first = builder.start_path(leader);
        builder.lines.push(vec![first]);
        while builder.build_next_line() {}

        let mut lanes: Vec<Vec<ProcessId>> = vec![Vec::new()];
        builder.allocate_to_lane(&mut lanes, leader);

        let mut drawer = Drawer::new(opts.lane_width, lanes.len(), builder.lines.len());
        for line_num in 0..builder.lines.len() {
            builder.draw_line(&mut drawer, line_num);
        }

        Diagram {
            lines: builder.lines.len(),
            lanes: lanes.len(),
            truncated: drawer.truncated(),
            grid: drawer.into_grid(),
            paths: builder.paths,
        }
    }

    pub fn line_count(&self) -> usize {
        self.lines
    }

    pub fn lane_count(&self) -> usize {
        self.lanes
    }

    /// True when some draw crossed into an earlier lane's territory; the
    /// cure is a wider `--lane-width`.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// (start_line, end_line, lane) of a process's path.
    pub fn path(&self, process: ProcessId) -> Option<(usize, usize, usize)> {
        self.paths.get(&process).map(|p| {
            (
                p.start_line.max(0) as usize,
                p.end_line.max(0) as usize,
                p.lane.max(0) as usize,
            )
        })
    }
}

struct Builder<'t> {
    tree: &'t ProcessTree,
    opts: DiagramOpts,
    leader: ProcessId,
    paths: HashMap<ProcessId, Path>,
    lines: Vec<Vec<Node>>,
}

impl<'t> Builder<'t> {
    fn hidden(&self, kind: &EventKind) -> bool {
        match kind {
            EventKind::Exec { calls, .. } => {
                if !self.opts.show_execs {
                    return true;
                }
                let failed = calls.last().is_some_and(|c| c.errcode != 0);
                failed && !self.opts.show_failed_execs
            }
            EventKind::Signal { killed, .. } => !killed && !self.opts.show_non_fatal_signals,
            EventKind::Kill { .. } | EventKind::Raise { .. } => !self.opts.show_signal_sends,
            _ => false,
        }
    }

    /// Find the next visible event at or after `start`. Finding a kill
    /// half advertises it on the path so the peer can rendezvous.
    fn next_event(&mut self, process: ProcessId, start: usize) -> Option<usize> {
        let node = self.tree.get(process);
        for index in start..node.event_count() {
            let event = node.event(index);
            if self.hidden(&event.kind) {
                continue;
            }
            if let EventKind::Kill { .. } = &event.kind {
                let path = self.paths.get_mut(&process).expect("path exists");
                debug_assert!(path.kill_partner.is_none());
                path.kill_partner = event.linked_path();
            }
            return Some(index);
        }
        None
    }

    /// The node that consumes `prev`'s next event.
    fn successor(&mut self, prev: &Node) -> Node {
        match prev.next {
            None => Node {
                process: prev.process,
                event: None,
                next: None,
            },
            Some(index) => Node {
                process: prev.process,
                event: Some(index),
                next: self.next_event(prev.process, index + 1),
            },
        }
    }

    /// The node that keeps a path going without consuming anything.
    fn continue_node(prev: &Node) -> Node {
        Node {
            process: prev.process,
            event: None,
            next: prev.next,
        }
    }

    /// The first node of a fresh path.
    fn start_path(&mut self, process: ProcessId) -> Node {
        Node {
            process,
            event: None,
            next: self.next_event(process, 0),
        }
    }

    /// A reaped process that has drawn all its events just lingers as a
    /// zombie ('.') until its reaper gets to it.
    fn zombie(&self, node: &Node) -> bool {
        self.tree.get(node.process).reaped() && node.next.is_none()
    }

    /// No successors allowed: the process has drawn everything and nobody
    /// is going to reap it on-diagram.
    fn end_of_path(&self, node: &Node) -> bool {
        !self.tree.get(node.process).reaped() && node.next.is_none()
    }

    /// Is `process` ready to be reaped on this line, judging by what it
    /// did on the previous one?
    fn ready_to_end(&self, process: ProcessId) -> bool {
        let prev_line = self.lines.last().expect("at least one line");
        prev_line
            .iter()
            .find(|node| node.process == process)
            .is_some_and(|node| node.next.is_none())
    }

    /// Resolve a link event at the head of `prev`'s path. Returns the
    /// process the horizontal line terminates on (None for forks, whose
    /// child isn't on the previous line, and for any deferral), plus
    /// whether anything actually advanced.
    fn resolve_link(
        &mut self,
        cur: &mut Vec<Node>,
        line_num: isize,
        prev: &Node,
        index: usize,
    ) -> (Option<ProcessId>, bool) {
        let event = self.tree.get(prev.process).event(index);
        let other = event.linked_path().expect("link event");

        match &event.kind {
            EventKind::Fork { .. } => {
                debug_assert!(!self.paths.contains_key(&other));
                self.paths.insert(other, Path::new(line_num));
                let succ = self.successor(prev);
                cur.push(succ);
                let start = self.start_path(other);
                cur.push(start);
                (None, true)
            }
            EventKind::Reap { .. } => {
                if !self.ready_to_end(other) {
                    cur.push(Self::continue_node(prev));
                    return (None, false);
                }
                self.paths.get_mut(&other).expect("path exists").end_line = line_num;
                let succ = self.successor(prev);
                cur.push(succ);
                (Some(other), true)
            }
            EventKind::Kill { .. } => {
                if !self.paths.contains_key(&other) {
                    // The peer's path hasn't been born yet; wait for it.
                    cur.push(Self::continue_node(prev));
                    return (None, false);
                }
                if self.paths[&prev.process].kill_partner.is_none() {
                    // The peer already saw us and cleared both pointers;
                    // it sits to our left and the line is being drawn.
                    debug_assert!(self.paths[&other].kill_partner.is_none());
                    let succ = self.successor(prev);
                    cur.push(succ);
                    return (None, true);
                }
                if self.paths[&other].kill_partner != Some(prev.process) {
                    // The peer isn't up to its half of the kill yet.
                    cur.push(Self::continue_node(prev));
                    return (None, false);
                }
                // Both sides are ready; neither is looking any more.
                self.paths.get_mut(&other).unwrap().kill_partner = None;
                self.paths.get_mut(&prev.process).unwrap().kill_partner = None;
                let succ = self.successor(prev);
                cur.push(succ);
                (Some(other), true)
            }
            _ => unreachable!("not a link event"),
        }
    }

    /// Derive the next line from the previous one. Returns false once the
    /// diagram has settled (or can make no further progress).
    fn build_next_line(&mut self) -> bool {
        let prev_line: Vec<Node> = self.lines.last().expect("at least one line").clone();
        let line_num = self.lines.len() as isize;
        let mut cur: Vec<Node> = Vec::new();
        let mut progress = false;

        // The process the current horizontal link line terminates on, when
        // we are inside one. Only one such line per diagram line; link
        // events that would overlap it are deferred.
        let mut link_end: Option<ProcessId> = None;

        for prev in &prev_line {
            // End the path here if there's nothing left for it to do: the
            // leader with no more events, or anyone unreapable.
            let terminal = (prev.process == self.leader && prev.next.is_none())
                || self.end_of_path(prev);
            if terminal && self.paths[&prev.process].end_line == -1 {
                let path = self.paths.get_mut(&prev.process).unwrap();
                path.end_line = (line_num - 1).max(path.start_line);
                progress = true;
            }

            if link_end == Some(prev.process) {
                link_end = None;
            }

            let Some(index) = prev.next else {
                // Out of events. Keep the path while it still reaches this
                // line (a zombie awaiting its reaper); otherwise drop it.
                let path = &self.paths[&prev.process];
                if path.end_line == -1 || path.end_line >= line_num {
                    cur.push(Self::continue_node(prev));
                }
                continue;
            };

            if self.tree.get(prev.process).event(index).is_link() {
                if link_end.is_some() {
                    // Already inside a horizontal line; defer this link so
                    // the two don't draw on top of each other.
                    cur.push(Self::continue_node(prev));
                    continue;
                }
                let (end, advanced) = self.resolve_link(&mut cur, line_num, prev, index);
                link_end = end;
                progress |= advanced;
            } else {
                let succ = self.successor(prev);
                cur.push(succ);
                progress = true;
            }
        }

        if cur.is_empty() {
            return false;
        }
        if !progress {
            // Nothing moved and nothing will: a link is waiting on a path
            // that can never appear (e.g. a kill into another tree).
            return false;
        }
        self.lines.push(cur);
        true
    }

    /// Drop `process`'s path onto the lanes, then its children in reverse
    /// fork order.
    fn allocate_to_lane(&mut self, lanes: &mut Vec<Vec<ProcessId>>, process: ProcessId) {
        let (my_start, my_end) = {
            let path = &self.paths[&process];
            (path.start_line, path.end_line)
        };

        let mut landed: Option<usize> = None;
        for lane in (0..lanes.len()).rev() {
            let collision = lanes[lane].iter().any(|other| {
                let path = &self.paths[other];
                my_end >= path.start_line && my_start <= path.end_line
            });
            if collision {
                if lane + 1 < lanes.len() {
                    landed = Some(lane + 1);
                } else {
                    lanes.push(Vec::new());
                    landed = Some(lanes.len() - 1);
                }
                break;
            }
        }
        // No collision anywhere means the path sinks to the bottom lane.
        let lane = landed.unwrap_or(0);
        self.paths.get_mut(&process).unwrap().lane = lane as isize;
        lanes[lane].push(process);

        let children: Vec<ProcessId> = self
            .tree
            .get(process)
            .events()
            .iter()
            .rev()
            .filter_map(|event| match &event.kind {
                EventKind::Fork { child } => Some(*child),
                _ => None,
            })
            .collect();
        for child in children {
            if self.paths.contains_key(&child) {
                self.allocate_to_lane(lanes, child);
            }
        }
    }

    fn draw_line(&self, drawer: &mut Drawer, line_num: usize) {
        let line = &self.lines[line_num];
        drawer.start_line(line_num);

        // The link line being drawn across lanes, if any, and whether it
        // runs "backwards" (receiver first): then the `+` terminator goes
        // on the near side and the event glyph on the far side.
        let mut cur_link: Option<(ProcessId, usize)> = None;
        let mut reversed = false;
        let mut prev_lane = 0usize;

        for node in line {
            let path = self.paths[&node.process];
            debug_assert!(path.lane >= prev_lane as isize);
            let lane = path.lane.max(0) as usize;

            if let Some((owner, index)) = cur_link {
                let event = self.tree.get(owner).event(index);
                for skipped in (prev_lane + 1)..lane {
                    drawer.start_lane(skipped);
                    drawer.draw_link(event.link_colour(self.tree), event.link_char(self.tree));
                }
            }
            drawer.start_lane(lane);
            prev_lane = lane;

            let path_char = if self.zombie(node) { '.' } else { '|' };

            let terminates_here = cur_link.is_some_and(|(owner, index)| {
                self.tree.get(owner).event(index).linked_path() == Some(node.process)
            });
            if terminates_here {
                let (owner, index) = cur_link.take().unwrap();
                if reversed {
                    let event = self.tree.get(owner).event(index);
                    event.draw(self.tree, owner, drawer);
                } else {
                    drawer.draw_char(Colour::White, '+', 1);
                }
                reversed = false;
            } else if let Some(index) = node.event {
                let event = self.tree.get(node.process).event(index);
                if event.is_link() {
                    debug_assert!(cur_link.is_none());
                    cur_link = Some((node.process, index));
                    reversed = matches!(&event.kind, EventKind::Kill { sender: false, .. });
                    if reversed {
                        drawer.draw_char(Colour::White, '+', 1);
                    } else {
                        event.draw(self.tree, node.process, drawer);
                    }
                } else {
                    event.draw(self.tree, node.process, drawer);
                }
            } else {
                drawer.draw_char(Colour::White, path_char, 1);
            }

            if let Some((owner, index)) = cur_link {
                let event = self.tree.get(owner).event(index);
                drawer.draw_link(event.link_colour(self.tree), event.link_char(self.tree));
            }

            if path.end_line > line_num as isize {
                drawer.draw_continuation(lane, Colour::White, path_char);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Ended, ProcessTree};

    fn opts() -> DiagramOpts {
        DiagramOpts::default()
    }

    /// Parent forks, waits, reaps; both exit 0.
    fn fork_and_reap_tree() -> (ProcessTree, ProcessId, ProcessId) {
        let mut tree = ProcessTree::new(true);
        let parent = tree.new_root(100, "parent".into(), vec!["parent".into()]);
        let child = tree.new_child(101, parent);
        tree.notify_forked(parent, child).unwrap();
        tree.notify_waiting(parent, -1, false).unwrap();
        tree.notify_ended(child, Ended::Exited(0)).unwrap();
        tree.notify_reaped(parent, child).unwrap();
        tree.notify_ended(parent, Ended::Exited(0)).unwrap();
        (tree, parent, child)
    }

    #[test]
    fn fork_and_reap_uses_two_lanes() {
        let (tree, parent, child) = fork_and_reap_tree();
        let diagram = Diagram::new(&tree, parent, opts());

        assert_eq!(diagram.lane_count(), 2);
        assert!(!diagram.truncated());

        let (p_start, p_end, p_lane) = diagram.path(parent).unwrap();
        let (c_start, c_end, c_lane) = diagram.path(child).unwrap();
        assert_eq!((p_start, p_lane), (0, 0));
        assert_eq!(c_lane, 1);
        assert!(c_start <= c_end);
        assert!(p_start <= p_end);
        assert!(p_end < diagram.line_count());
        assert!(c_end < diagram.line_count());
    }

    #[test]
    fn fork_and_reap_renders_expectedly() {
        let (tree, parent, _child) = fork_and_reap_tree();
        let diagram = Diagram::new(&tree, parent, opts());
        let text = diagram.grid().to_strings(false);

        // Event rows are the even ones; odd rows carry the continuations.
        assert_eq!(text[0], " |");
        assert_eq!(text[2], " +---+"); // fork
        assert_eq!(text[4], " |   0"); // child exits
        assert_eq!(text[6], " w---+"); // reap of "any child"
        assert_eq!(text[8], " 0"); // parent exits
    }

    #[test]
    fn orphaned_child_gets_bracketed_exit() {
        let mut tree = ProcessTree::new(true);
        let parent = tree.new_root(100, "parent".into(), vec!["parent".into()]);
        let child = tree.new_child(101, parent);
        tree.notify_forked(parent, child).unwrap();
        tree.notify_ended(parent, Ended::Exited(0)).unwrap();
        tree.notify_ended(child, Ended::Exited(7)).unwrap();
        tree.notify_orphaned(child).unwrap();

        let diagram = Diagram::new(&tree, parent, opts());
        let text = diagram.grid().to_strings(false);
        assert_eq!(text[4], " 0  (7)");
    }

    #[test]
    fn kill_pair_draws_forward_arrow() {
        let mut tree = ProcessTree::new(true);
        let a = tree.new_root(100, "a".into(), vec!["a".into()]);
        let b = tree.new_child(101, a);
        tree.notify_forked(a, b).unwrap();
        tree.notify_sent_signal(101, a, Some(b), 9, false).unwrap();
        tree.notify_waiting(a, -1, false).unwrap();
        tree.notify_ended(b, Ended::Signaled(9)).unwrap();
        tree.notify_reaped(a, b).unwrap();
        tree.notify_ended(a, Ended::Exited(0)).unwrap();

        let diagram = Diagram::new(&tree, a, opts());
        assert_eq!(diagram.lane_count(), 2);
        let text = diagram.grid().to_strings(false);
        assert_eq!(text[2], " +---+"); // fork
        assert_eq!(text[4], " 9>>>+"); // kill, sender on the left
        assert_eq!(text[8], " w~~~+"); // reap of a killed child
    }

    #[test]
    fn kill_pair_draws_reversed_arrow() {
        // The child kills the parent: the receiver sits to the left, so
        // the line is drawn backwards.
        let mut tree = ProcessTree::new(true);
        let a = tree.new_root(100, "a".into(), vec!["a".into()]);
        let b = tree.new_child(101, a);
        tree.notify_forked(a, b).unwrap();
        tree.notify_sent_signal(100, b, Some(a), 15, false).unwrap();
        tree.notify_ended(a, Ended::Signaled(15)).unwrap();
        tree.notify_ended(b, Ended::Exited(0)).unwrap();

        let diagram = Diagram::new(&tree, a, opts());
        let text = diagram.grid().to_strings(false);
        assert_eq!(text[4], " +<<<15");
    }

    #[test]
    fn paths_never_overlap_within_a_lane() {
        // Two sequential children can share a lane; make sure intervals
        // in a shared lane are disjoint.
        let mut tree = ProcessTree::new(true);
        let parent = tree.new_root(100, "p".into(), vec!["p".into()]);
        let c1 = tree.new_child(101, parent);
        tree.notify_forked(parent, c1).unwrap();
        tree.notify_waiting(parent, -1, false).unwrap();
        tree.notify_ended(c1, Ended::Exited(0)).unwrap();
        tree.notify_reaped(parent, c1).unwrap();
        let c2 = tree.new_child(102, parent);
        tree.notify_forked(parent, c2).unwrap();
        tree.notify_waiting(parent, -1, false).unwrap();
        tree.notify_ended(c2, Ended::Exited(0)).unwrap();
        tree.notify_reaped(parent, c2).unwrap();
        tree.notify_ended(parent, Ended::Exited(0)).unwrap();

        let diagram = Diagram::new(&tree, parent, opts());
        let paths: Vec<_> = [parent, c1, c2]
            .iter()
            .map(|id| diagram.path(*id).unwrap())
            .collect();
        for (i, a) in paths.iter().enumerate() {
            assert!(a.0 <= a.1, "start <= end");
            assert!(a.1 < diagram.line_count());
            for b in paths.iter().skip(i + 1) {
                if a.2 == b.2 {
                    let disjoint = a.1 < b.0 || b.1 < a.0;
                    assert!(disjoint, "overlap in lane {}: {a:?} vs {b:?}", a.2);
                }
            }
        }
    }

    #[test]
    fn hidden_execs_do_not_appear() {
        let mut tree = ProcessTree::new(true);
        let p = tree.new_root(100, "p".into(), vec!["p".into()]);
        tree.notify_exec(p, "/bin/true".into(), vec!["true".into()], 0)
            .unwrap();
        tree.notify_ended(p, Ended::Exited(0)).unwrap();

        let mut shown = opts();
        let diagram = Diagram::new(&tree, p, shown);
        assert!(diagram
            .grid()
            .to_strings(false)
            .iter()
            .any(|line| line.contains('E')));

        shown.show_execs = false;
        let diagram = Diagram::new(&tree, p, shown);
        assert!(!diagram
            .grid()
            .to_strings(false)
            .iter()
            .any(|line| line.contains('E')));
    }

    #[test]
    fn deep_fork_chain_settles() {
        // A straight line of forks exercises lane stacking.
        let mut tree = ProcessTree::new(true);
        let root = tree.new_root(100, "p".into(), vec!["p".into()]);
        let mut cur = root;
        for i in 0..5 {
            let child = tree.new_child(101 + i, cur);
            tree.notify_forked(cur, child).unwrap();
            cur = child;
        }
        let mut walk = root;
        loop {
            tree.notify_ended(walk, Ended::Exited(0)).unwrap();
            let next = tree
                .get(walk)
                .events()
                .iter()
                .find_map(|e| match &e.kind {
                    EventKind::Fork { child } => Some(*child),
                    _ => None,
                });
            match next {
                Some(child) => walk = child,
                None => break,
            }
        }

        let diagram = Diagram::new(&tree, root, opts());
        assert_eq!(diagram.lane_count(), 6);
        assert!(!diagram.truncated());
    }
}
