/// Recursively halves `out` along the row axis until a region holds at most
/// `threshold` pixels, then hands each row of the region to `kernel`.
///
/// `out` holds whole rows of `stride` elements; `y0` is the image row of its
/// first row so kernels can address the source. A single row is never split.
pub fn fork_join<T, K>(out: &mut [T], stride: usize, y0: u32, width: u32, threshold: usize, kernel: &K)
where
    T: Send,
    K: Fn(u32, &mut [T]) + Sync,
{
    if stride == 0 {
        return;
    }
    let height = out.len() / stride;
    if (width as usize) * height <= threshold || height < 2 {
        for (i, row) in out.chunks_exact_mut(stride).enumerate() {
            kernel(y0 + i as u32, row);
        }
        return;
    }

    let mid = height / 2;
    let (top, bottom) = out.split_at_mut(mid * stride);
    rayon::join(
        || fork_join(top, stride, y0, width, threshold, kernel),
        || fork_join(bottom, stride, y0 + mid as u32, width, threshold, kernel),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::thread::ThreadId;

    #[test]
    fn test_every_row_visited_once() {
        let (width, height) = (7u32, 53u32);
        let stride = width as usize;
        let mut out = vec![u32::MAX; stride * height as usize];
        fork_join(&mut out, stride, 0, width, 20, &|y, row: &mut [u32]| {
            for v in row.iter_mut() {
                assert_eq!(*v, u32::MAX, "row {y} written twice");
                *v = y;
            }
        });
        for (y, row) in out.chunks_exact(stride).enumerate() {
            assert!(row.iter().all(|&v| v == y as u32));
        }
    }

    #[test]
    fn test_small_region_stays_sequential() {
        let stride = 100;
        let mut out = vec![0u8; stride * 100];
        let threads = Mutex::new(HashSet::<ThreadId>::new());
        fork_join(&mut out, stride, 0, 100, 10_000, &|_, _row: &mut [u8]| {
            threads.lock().unwrap().insert(std::thread::current().id());
        });
        assert_eq!(threads.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_single_row_is_not_split() {
        let stride = 50_000;
        let mut out = vec![0u8; stride];
        let mut calls = Mutex::new(0);
        fork_join(&mut out, stride, 4, 50_000, 1, &|y, row: &mut [u8]| {
            assert_eq!(y, 4);
            assert_eq!(row.len(), stride);
            *calls.lock().unwrap() += 1;
        });
        assert_eq!(*calls.get_mut().unwrap(), 1);
    }
}
