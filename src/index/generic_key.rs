use std::cmp::Ordering;
use std::fmt;

/// A fixed-width key that can be copied in and out of a page's pair array.
pub trait IndexKey: Copy + Default + Send + Sync + 'static {
    /// Encoded width in bytes
    const LEN: usize;

    fn write_to(&self, dst: &mut [u8]);
    fn read_from(src: &[u8]) -> Self;
}

/// Opaque fixed-width key of N bytes (N in 4/8/16/32/64 for the standard
/// instantiations). The integer constructors store a little-endian prefix,
/// which is what `GenericComparator` orders by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericKey<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> Default for GenericKey<N> {
    fn default() -> Self {
        Self { data: [0u8; N] }
    }
}

impl<const N: usize> GenericKey<N> {
    pub fn new(data: [u8; N]) -> Self {
        Self { data }
    }

    pub fn from_i64(value: i64) -> Self {
        let mut data = [0u8; N];
        let bytes = value.to_le_bytes();
        let len = N.min(8);
        data[..len].copy_from_slice(&bytes[..len]);
        Self { data }
    }

    pub fn to_i64(&self) -> i64 {
        if N >= 8 {
            let bytes: [u8; 8] = self.data[..8].try_into().unwrap();
            i64::from_le_bytes(bytes)
        } else {
            let bytes: [u8; 4] = self.data[..4].try_into().unwrap();
            i32::from_le_bytes(bytes) as i64
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl<const N: usize> IndexKey for GenericKey<N> {
    const LEN: usize = N;

    fn write_to(&self, dst: &mut [u8]) {
        dst[..N].copy_from_slice(&self.data);
    }

    fn read_from(src: &[u8]) -> Self {
        let mut data = [0u8; N];
        data.copy_from_slice(&src[..N]);
        Self { data }
    }
}

impl<const N: usize> fmt::Display for GenericKey<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_i64())
    }
}

/// A total order over keys of type K.
pub trait KeyComparator<K>: Clone + Send + Sync + 'static {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders `GenericKey<N>` by its little-endian integer prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericComparator<const N: usize>;

impl<const N: usize> KeyComparator<GenericKey<N>> for GenericComparator<N> {
    fn compare(&self, a: &GenericKey<N>, b: &GenericKey<N>) -> Ordering {
        a.to_i64().cmp(&b.to_i64())
    }
}
