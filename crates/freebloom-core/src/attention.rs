use burn::prelude::*;

/// Multi-head scaled dot-product attention
///
/// All inputs are `[batch, heads, seq, head_dim]`. Keys and values may carry a
/// longer sequence than the queries when extra context has been appended.
pub fn qkv_attention<B: Backend>(q: Tensor<B, 4>, k: Tensor<B, 4>, v: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_batch, _heads, _seq_len, head_dim] = q.dims();
    let scale = (head_dim as f64).powf(-0.25);

    let q = q * scale;
    let k = k * scale;

    // [batch, heads, seq_q, seq_k]
    let attn = q.matmul(k.transpose());
    let attn = burn::tensor::activation::softmax(attn, 3);

    attn.matmul(v)
}

/// Split `[batch, seq, heads * head_dim]` into `[batch, heads, seq, head_dim]`
pub fn split_heads<B: Backend>(x: Tensor<B, 3>, num_heads: usize, head_dim: usize) -> Tensor<B, 4> {
    let [batch, seq_len, _] = x.dims();
    x.reshape([batch, seq_len, num_heads, head_dim]).swap_dims(1, 2)
}

/// Inverse of [`split_heads`]
pub fn merge_heads<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, heads, seq_len, head_dim] = x.dims();
    x.swap_dims(1, 2).reshape([batch, seq_len, heads * head_dim])
}
