use std::fmt;
use std::ptr::NonNull;

/// The backend's array record, mirrored field for field from the C side
/// (`Array` in the kernel header). Every generated struct field is a
/// pointer to one of these.
#[repr(C)]
#[derive(Debug)]
pub struct CArray {
    pub data: *mut f32,
    pub shape: *mut i64,
    pub ndim: i64,
    pub size: i64,
}

struct OwnedStorage {
    // Field order matters for drop only in that `record` points into the
    // two boxed slices; none of them own each other.
    data: Box<[f32]>,
    _shape: Box<[i64]>,
    record: Box<CArray>,
}

/// A host-side array: either storage this process owns, or a view over an
/// array record allocated by the loaded kernel library.
///
/// Foreign views never free the underlying storage; generated-code
/// allocations live until the model (and its library) are released, exactly
/// like the static cache they sit in.
pub struct HostArray {
    record: NonNull<CArray>,
    dims: Vec<usize>,
    storage: Option<OwnedStorage>,
}

impl HostArray {
    /// Allocates host-owned storage for `dims`, filled with `fill`.
    pub fn filled(dims: Vec<usize>, fill: f32) -> Self {
        let len: usize = dims.iter().product();
        let mut data = vec![fill; len].into_boxed_slice();
        let mut shape: Box<[i64]> = dims.iter().map(|d| *d as i64).collect();
        let mut record = Box::new(CArray {
            data: data.as_mut_ptr(),
            shape: shape.as_mut_ptr(),
            ndim: dims.len() as i64,
            size: len as i64,
        });
        let ptr = NonNull::from(record.as_mut());
        Self {
            record: ptr,
            dims,
            storage: Some(OwnedStorage {
                data,
                _shape: shape,
                record,
            }),
        }
    }

    pub fn zeros(dims: Vec<usize>) -> Self {
        Self::filled(dims, 0.0)
    }

    pub fn ones(dims: Vec<usize>) -> Self {
        Self::filled(dims, 1.0)
    }

    /// Uninitialized-by-convention scratch storage (zero filled; the
    /// generated code overwrites it).
    pub fn empty(dims: Vec<usize>) -> Self {
        Self::zeros(dims)
    }

    pub fn from_slice(values: &[f32], dims: Vec<usize>) -> Self {
        let mut array = Self::filled(dims, 0.0);
        if let Some(storage) = array.storage.as_mut() {
            storage.data.copy_from_slice(values);
        }
        array
    }

    /// Wraps an array record produced by the loaded library. The caller
    /// guarantees `ptr` stays valid for the model's lifetime; the view
    /// never frees it.
    ///
    /// # Safety
    /// `ptr` must point to a live `CArray` whose data buffer holds at least
    /// `dims.iter().product()` elements.
    pub unsafe fn from_foreign(ptr: NonNull<CArray>, dims: Vec<usize>) -> Self {
        Self {
            record: ptr,
            dims,
            storage: None,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw record pointer for marshaling into a foreign input struct.
    pub fn as_record_ptr(&self) -> *mut CArray {
        self.record.as_ptr()
    }

    pub fn as_slice(&self) -> &[f32] {
        let record = unsafe { self.record.as_ref() };
        unsafe { std::slice::from_raw_parts(record.data, self.len()) }
    }
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostArray")
            .field("dims", &self.dims)
            .field("owned", &self.storage.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_array_round_trips_values() {
        let array = HostArray::from_slice(&[1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        assert_eq!(array.shape(), &[2, 2]);
        assert_eq!(array.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn record_matches_host_view() {
        let array = HostArray::ones(vec![3]);
        let record = unsafe { &*array.as_record_ptr() };
        assert_eq!(record.ndim, 1);
        assert_eq!(record.size, 3);
        let dims = unsafe { std::slice::from_raw_parts(record.shape, 1) };
        assert_eq!(dims, &[3]);
    }

    #[test]
    fn record_pointer_survives_moves() {
        let array = HostArray::zeros(vec![8]);
        let before = array.as_record_ptr();
        let moved = array;
        assert_eq!(before, moved.as_record_ptr());
        assert_eq!(moved.as_slice().len(), 8);
    }
}
