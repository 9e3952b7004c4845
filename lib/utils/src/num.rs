//! Alignment helpers for offsets and sizes.

/// Values that can be rounded to a power-of-two boundary.
pub trait AlignableTo: Sized + Copy {
    /// Round up to the next multiple of `align`. `align` must be a power of two.
    fn align_up(self, align: Self) -> Self;
    /// Round down to the previous multiple of `align`. `align` must be a power of two.
    fn align_down(self, align: Self) -> Self;
    /// Whether the value is already a multiple of `align`.
    fn is_aligned(self, align: Self) -> bool;
}

macro_rules! impl_alignable {
    ($($type: ty),*) => {
        $(
            impl AlignableTo for $type {
                #[inline(always)]
                fn align_up(self, align: Self) -> Self {
                    debug_assert!(align.is_power_of_two());
                    (self + align - 1) & !(align - 1)
                }

                #[inline(always)]
                fn align_down(self, align: Self) -> Self {
                    debug_assert!(align.is_power_of_two());
                    self & !(align - 1)
                }

                #[inline(always)]
                fn is_aligned(self, align: Self) -> bool {
                    self & (align - 1) == 0
                }
            }
        )*
    };
}

impl_alignable!(usize, u32, u64);
