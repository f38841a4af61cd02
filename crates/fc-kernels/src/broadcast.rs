/// Right-aligned broadcast of two shapes; `None` when a dimension pair is
/// neither equal nor contains a 1.
#[must_use]
pub fn broadcast_shapes(lhs: &[u32], rhs: &[u32]) -> Option<Vec<u32>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0_u32; rank];
    for axis in 0..rank {
        let left = dim_from_right(lhs, rank - 1 - axis);
        let right = dim_from_right(rhs, rank - 1 - axis);
        out[axis] = match (left, right) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
    }
    Some(out)
}

fn dim_from_right(dims: &[u32], offset_from_right: usize) -> u32 {
    if offset_from_right < dims.len() {
        dims[dims.len() - 1 - offset_from_right]
    } else {
        1
    }
}

/// Maps every linear index of `out_dims` to the linear index of an operand of
/// shape `in_dims` broadcast into it.
pub(crate) fn broadcast_source_indices(in_dims: &[u32], out_dims: &[u32]) -> Vec<usize> {
    let out_count = out_dims.iter().map(|dim| *dim as usize).product::<usize>();
    let offset = out_dims.len() - in_dims.len();

    let mut in_strides = vec![0_usize; in_dims.len()];
    let mut stride = 1_usize;
    for axis in (0..in_dims.len()).rev() {
        in_strides[axis] = if in_dims[axis] == 1 { 0 } else { stride };
        stride *= in_dims[axis] as usize;
    }

    let mut indices = Vec::with_capacity(out_count);
    let mut coords = vec![0_usize; out_dims.len()];
    for _ in 0..out_count {
        let source = (0..in_dims.len())
            .map(|axis| coords[axis + offset] * in_strides[axis])
            .sum();
        indices.push(source);

        for axis in (0..out_dims.len()).rev() {
            coords[axis] += 1;
            if coords[axis] < out_dims[axis] as usize {
                break;
            }
            coords[axis] = 0;
        }
    }
    indices
}
