/// A pool of free frames, addressed by their offset into the UMEM.
///
/// `get` hands frames out and `put` takes them back. Implementations decide how frames are
/// stored; the socket only relies on a frame never being handed out twice.
pub trait BufPool {
    /// Move up to `num` free frames into `bufs`. Returns how many were moved.
    fn get(&mut self, bufs: &mut Vec<u64>, num: usize) -> usize;

    /// Return up to `num` frames taken from the back of `bufs`. Returns how many were accepted.
    fn put(&mut self, bufs: &mut Vec<u64>, num: usize) -> usize;

    /// Return one frame. Returns 1 if accepted, 0 if the frame was already free or unknown.
    fn put_buf(&mut self, buf: u64) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool;
}
