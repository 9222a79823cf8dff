//! Decides which files get a writer.
//!
//! A requested file always gets one. A deselected file gets one too when a
//! piece-aligned write for a requested neighbor would touch its bytes:
//!
//! - Backward: every predecessor that overlaps the first piece of a
//!   requested file is activated and marked for allocation. The walk is
//!   bounded by that one piece, so an entry activated this way never pulls
//!   in its own predecessor.
//! - Forward: every successor starting inside the last piece of a requested
//!   non-empty file is activated without being marked for allocation.
//!
//! Zero-length files are point boundaries: they occupy the piece containing
//! their offset, can be activated by either walk, and propagate backward
//! but not forward.

use std::borrow::Borrow;

use super::file::FileEntry;

/// Outcome of activation for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Activation {
    pub active: bool,
    pub needs_file_allocation: bool,
}

/// Computes the activation of every file. `piece_length` must be positive
/// and `files` contiguous.
pub fn activate<F: Borrow<FileEntry>>(files: &[F], piece_length: u64) -> Vec<Activation> {
    let mut result: Vec<Activation> = files
        .iter()
        .map(|f| {
            let requested = f.borrow().requested;
            Activation {
                active: requested,
                needs_file_allocation: requested,
            }
        })
        .collect();

    for (index, file) in files.iter().enumerate() {
        let file = file.borrow();
        if !file.requested {
            continue;
        }

        let piece_start = file.first_piece(piece_length) * piece_length;
        let before = files[..index].iter().zip(result[..index].iter_mut());
        for (prev, activation) in before.rev() {
            let prev = prev.borrow();
            if piece_start > prev.offset && piece_start >= prev.end_offset() {
                break;
            }
            activation.active = true;
            activation.needs_file_allocation = true;
        }

        if file.length == 0 {
            continue;
        }
        let last_piece_end = (file.last_piece(piece_length) + 1) * piece_length;
        let after = files[index + 1..].iter().zip(result[index + 1..].iter_mut());
        for (next, activation) in after {
            if next.borrow().offset >= last_piece_end {
                break;
            }
            activation.active = true;
        }
    }

    for (file, activation) in files.iter().zip(&result) {
        let file = file.borrow();
        if activation.active && !file.requested {
            tracing::debug!(
                path = %file.path.display(),
                needs_file_allocation = activation.needs_file_allocation,
                "activating deselected file sharing a piece with a requested file"
            );
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    //           1    1    2    2    3
    // 0....5....0....5....0....5....0
    // ++--++--++--++--++--++--++--++--
    // | file0
    // *************** file1
    //                ******* file2
    //                       | file3
    //                       ** file4
    //                         | file5
    //                         *** file6
    //                            | file7
    //                            ** file8
    fn layout(deselected: &[usize]) -> Vec<FileEntry> {
        let sizes = [
            (0, 0),
            (15, 0),
            (7, 15),
            (0, 22),
            (2, 22),
            (0, 24),
            (3, 24),
            (0, 27),
            (2, 27),
        ];
        sizes
            .iter()
            .enumerate()
            .map(|(i, &(length, offset))| {
                FileEntry::new(format!("file{i}.txt"), length, offset)
                    .with_requested(!deselected.contains(&i))
            })
            .collect()
    }

    fn active(deselected: &[usize]) -> Vec<bool> {
        activate(&layout(deselected), 2)
            .iter()
            .map(|a| a.active)
            .collect()
    }

    #[test]
    fn test_all_requested() {
        assert!(active(&[]).iter().all(|&a| a));
    }

    #[test]
    fn test_first_deselected_is_pulled_in_by_successor() {
        let result = activate(&layout(&[0]), 2);
        assert!(result[0].active);
        assert!(result[0].needs_file_allocation);
    }

    #[test]
    fn test_propagation_is_one_piece_deep() {
        let result = activate(&layout(&[0, 1]), 2);
        assert!(!result[0].active);
        assert!(result[1].active);
        assert!(result[1].needs_file_allocation);
        assert!(result[2].active);
        assert!(result[3].active);
        assert!(result[4].active);
        assert!(result[5].active);
    }

    #[test]
    fn test_zero_length_entry_linked_to_requested_successor() {
        let result = activate(&layout(&[3]), 2);
        assert!(result[3].active);
        assert!(result[3].needs_file_allocation);
        assert!(result[4].active);
    }

    #[test]
    fn test_zero_length_predecessor_does_not_pull_in_successor() {
        let a = active(&[4]);
        assert!(a[3]);
        assert!(!a[4]);
        assert!(a[5]);
    }

    #[test]
    fn test_zero_length_and_successor_both_deselected() {
        let a = active(&[3, 4]);
        assert!(a[2]);
        assert!(!a[3]);
        assert!(!a[4]);
        assert!(a[5]);
    }

    #[test]
    fn test_trailing_files_deselected() {
        let a = active(&[5, 6, 7, 8]);
        assert!(a[..5].iter().all(|&x| x));
        assert!(!a[5]);
    }

    #[test]
    fn test_only_zero_length_head_requested() {
        let a = active(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            a,
            vec![true, false, false, false, false, false, false, false, false]
        );
    }

    #[test]
    fn test_forward_link_does_not_need_allocation() {
        let result = activate(&layout(&[2, 3, 4, 5, 6, 7, 8]), 2);
        assert!(result[0].active);
        assert!(result[1].active);
        assert!(result[2].active);
        assert!(!result[2].needs_file_allocation);
        assert!(!result[3].active);
        assert!(!result[4].active);
        assert!(!result[5].active);
    }

    #[test]
    fn test_links_in_both_directions_from_middle_file() {
        let a = active(&[0, 1, 2, 3, 4, 5, 8]);
        assert!(a[..5].iter().all(|&x| !x));
        assert!(a[5]);
        assert!(a[6]);
        assert!(a[7]);
        assert!(a[8]);
    }

    #[test]
    fn test_activation_is_deterministic() {
        let files = layout(&[0, 1, 4]);
        assert_eq!(activate(&files, 2), activate(&files, 2));
    }
}
