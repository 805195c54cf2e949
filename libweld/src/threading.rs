//! Parallel primitives. Ordinary fork-join passes use rayon's parallel iterators directly; this
//! module adds the one extra shape the pipeline needs: a work-stealing traversal where processing
//! an item can produce more items (archive-member activation and the GC mark phase).

use rayon::Scope;

/// Runs `process` over `items` and over everything `process` transitively returns. Items are
/// processed in no particular order and the call returns once the whole frontier is drained.
///
/// One returned item is processed inline to keep hot chains on the same thread; the rest are
/// spawned so idle threads can steal them.
pub(crate) fn for_each_spawn<T, F>(items: Vec<T>, process: F)
where
    T: Send,
    F: Fn(T) -> Vec<T> + Sync,
{
    let process = &process;
    rayon::in_place_scope(|scope| {
        for item in items {
            scope.spawn(move |scope| run(item, process, scope));
        }
    });
}

fn run<'scope, T, F>(item: T, process: &'scope F, scope: &Scope<'scope>)
where
    T: Send + 'scope,
    F: Fn(T) -> Vec<T> + Sync,
{
    let mut next = process(item);
    while let Some(item) = next.pop() {
        for stolen in next.drain(..) {
            scope.spawn(move |scope| run(stolen, process, scope));
        }
        next = process(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[test]
    fn traverses_whole_graph_once() {
        // A graph where node i links to 2i+1 and 2i+2; marking uses exchange so each node is
        // expanded exactly once even though edges race.
        const N: usize = 500;
        let visited: Vec<AtomicBool> = (0..N).map(|_| AtomicBool::new(false)).collect();
        let expansions = AtomicUsize::new(0);

        visited[0].store(true, Ordering::Relaxed);
        for_each_spawn(vec![0usize], |node| {
            expansions.fetch_add(1, Ordering::Relaxed);
            [2 * node + 1, 2 * node + 2]
                .into_iter()
                .filter(|&n| n < N && !visited[n].swap(true, Ordering::Relaxed))
                .collect()
        });

        assert_eq!(expansions.load(Ordering::Relaxed), N);
        assert!(visited.iter().all(|v| v.load(Ordering::Relaxed)));
    }
}
