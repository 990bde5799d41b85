use core::mem::MaybeUninit;

use super::Init;

/// Untyped storage of the specified size and alignment, used by the
/// [`build!`] macro to reserve stack regions.
///
/// [`build!`]: crate::build
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AlignedStorage<const LEN: usize, const ALIGN: usize>(
    elain::Align<ALIGN>,
    [MaybeUninit<u8>; LEN],
)
where
    elain::Align<ALIGN>: elain::Alignment;

impl<const LEN: usize, const ALIGN: usize> Init for AlignedStorage<LEN, ALIGN>
where
    elain::Align<ALIGN>: elain::Alignment,
{
    const INIT: Self = Self(elain::Align::NEW, [MaybeUninit::uninit(); LEN]);
}

impl<const LEN: usize, const ALIGN: usize> AlignedStorage<LEN, ALIGN>
where
    elain::Align<ALIGN>: elain::Alignment,
{
    /// The length of the storage in bytes.
    pub const LEN: usize = LEN;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_align() {
        assert_eq!(core::mem::size_of::<AlignedStorage<24, 8>>(), 24);
        assert_eq!(core::mem::align_of::<AlignedStorage<24, 8>>(), 8);
        assert_eq!(core::mem::align_of::<AlignedStorage<3, 128>>(), 128);
    }
}
