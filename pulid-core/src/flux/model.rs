//! Flux transformer with PuLID identity cross-attention.
//!
//! The double/single stream blocks follow the reference Flux layout. After every
//! [`DOUBLE_INTERVAL`]-th double block and every [`SINGLE_INTERVAL`]-th single block a
//! perceiver cross-attention reads the identity tokens and adds its output to the image
//! stream, scaled by the identity weight. With no identity the model is plain Flux.

use candle_core::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{LayerNorm, Linear, RmsNorm, VarBuilder};
pub use candle_transformers::models::flux::model::Config;

pub const DOUBLE_INTERVAL: usize = 2;
pub const SINGLE_INTERVAL: usize = 4;

/// Width of the identity tokens produced by the PuLID encoder.
pub const ID_DIM: usize = 2048;

fn layer_norm(dim: usize, vb: VarBuilder) -> Result<LayerNorm> {
    let ws = Tensor::ones(dim, vb.dtype(), vb.device())?;
    Ok(LayerNorm::new_no_bias(ws, 1e-6))
}

fn scaled_dot_product_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let dim = q.dim(D::Minus1)?;
    let scale_factor = 1.0 / (dim as f64).sqrt();
    let mut batch_dims = q.dims().to_vec();
    batch_dims.pop();
    batch_dims.pop();
    let q = q.flatten_to(batch_dims.len() - 1)?;
    let k = k.flatten_to(batch_dims.len() - 1)?;
    let v = v.flatten_to(batch_dims.len() - 1)?;
    let attn_weights = (q.matmul(&k.t()?)? * scale_factor)?;
    let attn_scores = candle_nn::ops::softmax_last_dim(&attn_weights)?.matmul(&v)?;
    batch_dims.push(attn_scores.dim(D::Minus2)?);
    batch_dims.push(attn_scores.dim(D::Minus1)?);
    attn_scores.reshape(batch_dims)
}

fn rope(pos: &Tensor, dim: usize, theta: usize) -> Result<Tensor> {
    if dim % 2 == 1 {
        candle_core::bail!("dim {dim} is odd")
    }
    let dev = pos.device();
    let theta = theta as f64;
    let inv_freq: Vec<_> = (0..dim)
        .step_by(2)
        .map(|i| 1f32 / theta.powf(i as f64 / dim as f64) as f32)
        .collect();
    let inv_freq_len = inv_freq.len();
    let inv_freq = Tensor::from_vec(inv_freq, (1, 1, inv_freq_len), dev)?;
    let inv_freq = inv_freq.to_dtype(pos.dtype())?;
    let freqs = pos.unsqueeze(2)?.broadcast_mul(&inv_freq)?;
    let cos = freqs.cos()?;
    let sin = freqs.sin()?;
    let out = Tensor::stack(&[&cos, &sin.neg()?, &sin, &cos], 3)?;
    let (b, n, d, _ij) = out.dims4()?;
    out.reshape((b, n, d, 2, 2))
}

fn apply_rope(x: &Tensor, freq_cis: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let (b_sz, n_head, seq_len, n_embd) = x.dims4()?;
    let x = x.reshape((b_sz, n_head, seq_len, n_embd / 2, 2))?;
    let x0 = x.narrow(D::Minus1, 0, 1)?;
    let x1 = x.narrow(D::Minus1, 1, 1)?;
    let fr0 = freq_cis.get_on_dim(D::Minus1, 0)?;
    let fr1 = freq_cis.get_on_dim(D::Minus1, 1)?;
    (fr0.broadcast_mul(&x0)? + fr1.broadcast_mul(&x1)?)?.reshape(dims.to_vec())
}

fn attention(q: &Tensor, k: &Tensor, v: &Tensor, pe: &Tensor) -> Result<Tensor> {
    let q = apply_rope(q, pe)?.contiguous()?;
    let k = apply_rope(k, pe)?.contiguous()?;
    let x = scaled_dot_product_attention(&q, &k, v)?;
    x.transpose(1, 2)?.flatten_from(2)
}

fn timestep_embedding(t: &Tensor, dim: usize, dtype: DType) -> Result<Tensor> {
    const TIME_FACTOR: f64 = 1000.;
    const MAX_PERIOD: f64 = 10000.;
    if dim % 2 == 1 {
        candle_core::bail!("{dim} is odd")
    }
    let dev = t.device();
    let half = dim / 2;
    let t = (t * TIME_FACTOR)?;
    let arange = Tensor::arange(0, half as u32, dev)?.to_dtype(DType::F32)?;
    let freqs = (arange * (-MAX_PERIOD.ln() / half as f64))?.exp()?;
    let args = t
        .unsqueeze(1)?
        .to_dtype(DType::F32)?
        .broadcast_mul(&freqs.unsqueeze(0)?)?;
    Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)?.to_dtype(dtype)
}

#[derive(Debug, Clone)]
struct EmbedNd {
    theta: usize,
    axes_dim: Vec<usize>,
}

impl Module for EmbedNd {
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let n_axes = ids.dim(D::Minus1)?;
        let mut emb = Vec::with_capacity(n_axes);
        for idx in 0..n_axes {
            let r = rope(
                &ids.get_on_dim(D::Minus1, idx)?,
                self.axes_dim[idx],
                self.theta,
            )?;
            emb.push(r)
        }
        let emb = Tensor::cat(&emb, 2)?;
        emb.unsqueeze(1)
    }
}

#[derive(Debug, Clone)]
struct MlpEmbedder {
    in_layer: Linear,
    out_layer: Linear,
}

impl MlpEmbedder {
    fn new(in_sz: usize, h_sz: usize, vb: VarBuilder) -> Result<Self> {
        let in_layer = candle_nn::linear(in_sz, h_sz, vb.pp("in_layer"))?;
        let out_layer = candle_nn::linear(h_sz, h_sz, vb.pp("out_layer"))?;
        Ok(Self {
            in_layer,
            out_layer,
        })
    }
}

impl Module for MlpEmbedder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.in_layer)?.silu()?.apply(&self.out_layer)
    }
}

#[derive(Debug, Clone)]
struct QkNorm {
    query_norm: RmsNorm,
    key_norm: RmsNorm,
}

impl QkNorm {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let query_norm = vb.get(dim, "query_norm.scale")?;
        let query_norm = RmsNorm::new(query_norm, 1e-6);
        let key_norm = vb.get(dim, "key_norm.scale")?;
        let key_norm = RmsNorm::new(key_norm, 1e-6);
        Ok(Self {
            query_norm,
            key_norm,
        })
    }
}

struct ModulationOut {
    shift: Tensor,
    scale: Tensor,
    gate: Tensor,
}

impl ModulationOut {
    fn scale_shift(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_mul(&(&self.scale + 1.)?)?
            .broadcast_add(&self.shift)
    }

    fn gate(&self, xs: &Tensor) -> Result<Tensor> {
        self.gate.broadcast_mul(xs)
    }
}

#[derive(Debug, Clone)]
struct Modulation1 {
    lin: Linear,
}

impl Modulation1 {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let lin = candle_nn::linear(dim, 3 * dim, vb.pp("lin"))?;
        Ok(Self { lin })
    }

    fn forward(&self, vec_: &Tensor) -> Result<ModulationOut> {
        let ys = vec_
            .silu()?
            .apply(&self.lin)?
            .unsqueeze(1)?
            .chunk(3, D::Minus1)?;
        if ys.len() != 3 {
            candle_core::bail!("unexpected len from chunk {ys:?}")
        }
        Ok(ModulationOut {
            shift: ys[0].clone(),
            scale: ys[1].clone(),
            gate: ys[2].clone(),
        })
    }
}

#[derive(Debug, Clone)]
struct Modulation2 {
    lin: Linear,
}

impl Modulation2 {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let lin = candle_nn::linear(dim, 6 * dim, vb.pp("lin"))?;
        Ok(Self { lin })
    }

    fn forward(&self, vec_: &Tensor) -> Result<(ModulationOut, ModulationOut)> {
        let ys = vec_
            .silu()?
            .apply(&self.lin)?
            .unsqueeze(1)?
            .chunk(6, D::Minus1)?;
        if ys.len() != 6 {
            candle_core::bail!("unexpected len from chunk {ys:?}")
        }
        let mod1 = ModulationOut {
            shift: ys[0].clone(),
            scale: ys[1].clone(),
            gate: ys[2].clone(),
        };
        let mod2 = ModulationOut {
            shift: ys[3].clone(),
            scale: ys[4].clone(),
            gate: ys[5].clone(),
        };
        Ok((mod1, mod2))
    }
}

#[derive(Debug, Clone)]
struct SelfAttention {
    qkv: Linear,
    norm: QkNorm,
    proj: Linear,
    num_heads: usize,
}

impl SelfAttention {
    fn new(dim: usize, num_heads: usize, qkv_bias: bool, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / num_heads;
        let qkv = candle_nn::linear_b(dim, dim * 3, qkv_bias, vb.pp("qkv"))?;
        let norm = QkNorm::new(head_dim, vb.pp("norm"))?;
        let proj = candle_nn::linear(dim, dim, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            norm,
            proj,
            num_heads,
        })
    }

    fn qkv(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let qkv = xs.apply(&self.qkv)?;
        let (b, l, _khd) = qkv.dims3()?;
        let qkv = qkv.reshape((b, l, 3, self.num_heads, ()))?;
        let q = qkv.i((.., .., 0))?.transpose(1, 2)?;
        let k = qkv.i((.., .., 1))?.transpose(1, 2)?;
        let v = qkv.i((.., .., 2))?.transpose(1, 2)?;
        let q = q.apply(&self.norm.query_norm)?;
        let k = k.apply(&self.norm.key_norm)?;
        Ok((q, k, v))
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    lin1: Linear,
    lin2: Linear,
}

impl Mlp {
    fn new(in_sz: usize, mlp_sz: usize, vb: VarBuilder) -> Result<Self> {
        let lin1 = candle_nn::linear(in_sz, mlp_sz, vb.pp("0"))?;
        let lin2 = candle_nn::linear(mlp_sz, in_sz, vb.pp("2"))?;
        Ok(Self { lin1, lin2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.lin1)?.gelu()?.apply(&self.lin2)
    }
}

#[derive(Debug, Clone)]
struct DoubleStreamBlock {
    img_mod: Modulation2,
    img_norm1: LayerNorm,
    img_attn: SelfAttention,
    img_norm2: LayerNorm,
    img_mlp: Mlp,
    txt_mod: Modulation2,
    txt_norm1: LayerNorm,
    txt_attn: SelfAttention,
    txt_norm2: LayerNorm,
    txt_mlp: Mlp,
}

impl DoubleStreamBlock {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let h_sz = cfg.hidden_size;
        let mlp_sz = (h_sz as f64 * cfg.mlp_ratio) as usize;
        Ok(Self {
            img_mod: Modulation2::new(h_sz, vb.pp("img_mod"))?,
            img_norm1: layer_norm(h_sz, vb.pp("img_norm1"))?,
            img_attn: SelfAttention::new(h_sz, cfg.num_heads, cfg.qkv_bias, vb.pp("img_attn"))?,
            img_norm2: layer_norm(h_sz, vb.pp("img_norm2"))?,
            img_mlp: Mlp::new(h_sz, mlp_sz, vb.pp("img_mlp"))?,
            txt_mod: Modulation2::new(h_sz, vb.pp("txt_mod"))?,
            txt_norm1: layer_norm(h_sz, vb.pp("txt_norm1"))?,
            txt_attn: SelfAttention::new(h_sz, cfg.num_heads, cfg.qkv_bias, vb.pp("txt_attn"))?,
            txt_norm2: layer_norm(h_sz, vb.pp("txt_norm2"))?,
            txt_mlp: Mlp::new(h_sz, mlp_sz, vb.pp("txt_mlp"))?,
        })
    }

    fn forward(
        &self,
        img: &Tensor,
        txt: &Tensor,
        vec_: &Tensor,
        pe: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (img_mod1, img_mod2) = self.img_mod.forward(vec_)?; // shift, scale, gate
        let (txt_mod1, txt_mod2) = self.txt_mod.forward(vec_)?; // shift, scale, gate
        let img_modulated = img_mod1.scale_shift(&img.apply(&self.img_norm1)?)?;
        let (img_q, img_k, img_v) = self.img_attn.qkv(&img_modulated)?;

        let txt_modulated = txt_mod1.scale_shift(&txt.apply(&self.txt_norm1)?)?;
        let (txt_q, txt_k, txt_v) = self.txt_attn.qkv(&txt_modulated)?;

        let q = Tensor::cat(&[txt_q, img_q], 2)?;
        let k = Tensor::cat(&[txt_k, img_k], 2)?;
        let v = Tensor::cat(&[txt_v, img_v], 2)?;

        let attn = attention(&q, &k, &v, pe)?;
        let txt_len = txt.dim(1)?;
        let txt_attn = attn.narrow(1, 0, txt_len)?;
        let img_attn = attn.narrow(1, txt_len, attn.dim(1)? - txt_len)?;

        let img = (img + img_mod1.gate(&img_attn.apply(&self.img_attn.proj)?))?;
        let img = (&img
            + img_mod2.gate(
                &img_mod2
                    .scale_shift(&img.apply(&self.img_norm2)?)?
                    .apply(&self.img_mlp)?,
            )?)?;

        let txt = (txt + txt_mod1.gate(&txt_attn.apply(&self.txt_attn.proj)?))?;
        let txt = (&txt
            + txt_mod2.gate(
                &txt_mod2
                    .scale_shift(&txt.apply(&self.txt_norm2)?)?
                    .apply(&self.txt_mlp)?,
            )?)?;

        Ok((img, txt))
    }
}

#[derive(Debug, Clone)]
struct SingleStreamBlock {
    linear1: Linear,
    linear2: Linear,
    norm: QkNorm,
    pre_norm: LayerNorm,
    modulation: Modulation1,
    h_sz: usize,
    mlp_sz: usize,
    num_heads: usize,
}

impl SingleStreamBlock {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let h_sz = cfg.hidden_size;
        let mlp_sz = (h_sz as f64 * cfg.mlp_ratio) as usize;
        let head_dim = h_sz / cfg.num_heads;
        Ok(Self {
            linear1: candle_nn::linear(h_sz, h_sz * 3 + mlp_sz, vb.pp("linear1"))?,
            linear2: candle_nn::linear(h_sz + mlp_sz, h_sz, vb.pp("linear2"))?,
            norm: QkNorm::new(head_dim, vb.pp("norm"))?,
            pre_norm: layer_norm(h_sz, vb.pp("pre_norm"))?,
            modulation: Modulation1::new(h_sz, vb.pp("modulation"))?,
            h_sz,
            mlp_sz,
            num_heads: cfg.num_heads,
        })
    }

    fn forward(&self, xs: &Tensor, vec_: &Tensor, pe: &Tensor) -> Result<Tensor> {
        let mod_ = self.modulation.forward(vec_)?;
        let x_mod = mod_.scale_shift(&xs.apply(&self.pre_norm)?)?;
        let x_mod = x_mod.apply(&self.linear1)?;
        let qkv = x_mod.narrow(D::Minus1, 0, 3 * self.h_sz)?;
        let (b, l, _khd) = qkv.dims3()?;
        let qkv = qkv.reshape((b, l, 3, self.num_heads, ()))?;
        let q = qkv.i((.., .., 0))?.transpose(1, 2)?;
        let k = qkv.i((.., .., 1))?.transpose(1, 2)?;
        let v = qkv.i((.., .., 2))?.transpose(1, 2)?;
        let mlp = x_mod.narrow(D::Minus1, 3 * self.h_sz, self.mlp_sz)?;
        let q = q.apply(&self.norm.query_norm)?;
        let k = k.apply(&self.norm.key_norm)?;
        let attn = attention(&q, &k, &v, pe)?;
        let output = Tensor::cat(&[attn, mlp.gelu()?], 2)?.apply(&self.linear2)?;
        xs + mod_.gate(&output)
    }
}

#[derive(Debug, Clone)]
struct LastLayer {
    norm_final: LayerNorm,
    linear: Linear,
    ada_ln_modulation: Linear,
}

impl LastLayer {
    fn new(h_sz: usize, p_sz: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm_final: layer_norm(h_sz, vb.pp("norm_final"))?,
            linear: candle_nn::linear(h_sz, p_sz * p_sz * out_c, vb.pp("linear"))?,
            ada_ln_modulation: candle_nn::linear(h_sz, 2 * h_sz, vb.pp("adaLN_modulation.1"))?,
        })
    }

    fn forward(&self, xs: &Tensor, vec: &Tensor) -> Result<Tensor> {
        let chunks = vec.silu()?.apply(&self.ada_ln_modulation)?.chunk(2, 1)?;
        let (shift, scale) = (&chunks[0], &chunks[1]);
        let xs = xs
            .apply(&self.norm_final)?
            .broadcast_mul(&(scale.unsqueeze(1)? + 1.0)?)?
            .broadcast_add(&shift.unsqueeze(1)?)?;
        xs.apply(&self.linear)
    }
}

/// Cross-attention from image tokens (queries) to identity tokens (keys/values).
#[derive(Debug, Clone)]
pub struct PerceiverAttentionCa {
    norm1: LayerNorm,
    norm2: LayerNorm,
    to_q: Linear,
    to_kv: Linear,
    to_out: Linear,
    heads: usize,
    dim_head: usize,
}

impl PerceiverAttentionCa {
    pub fn new(dim: usize, kv_dim: usize, dim_head: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        let inner_dim = dim_head * heads;
        Ok(Self {
            norm1: candle_nn::layer_norm(kv_dim, 1e-5, vb.pp("norm1"))?,
            norm2: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            to_q: candle_nn::linear_no_bias(dim, inner_dim, vb.pp("to_q"))?,
            to_kv: candle_nn::linear_no_bias(kv_dim, inner_dim * 2, vb.pp("to_kv"))?,
            to_out: candle_nn::linear_no_bias(inner_dim, dim, vb.pp("to_out"))?,
            heads,
            dim_head,
        })
    }

    fn heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, l, _) = xs.dims3()?;
        xs.reshape((b, l, self.heads, self.dim_head))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, id: &Tensor, latents: &Tensor) -> Result<Tensor> {
        let x = id.apply(&self.norm1)?;
        let latents = latents.apply(&self.norm2)?;
        let (b, seq_len, _) = latents.dims3()?;

        let q = self.heads(&latents.apply(&self.to_q)?)?;
        let kv = x.apply(&self.to_kv)?.chunk(2, D::Minus1)?;
        let k = self.heads(&kv[0])?;
        let v = self.heads(&kv[1])?;

        // Split the softmax scale between q and k for fp16 stability.
        let scale = 1. / (self.dim_head as f64).sqrt().sqrt();
        let weight = (q * scale)?.matmul(&(k * scale)?.t()?)?;
        let dtype = weight.dtype();
        let weight = candle_nn::ops::softmax_last_dim(&weight.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
        let out = weight.matmul(&v)?;
        out.transpose(1, 2)?
            .reshape((b, seq_len, ()))?
            .apply(&self.to_out)
    }
}

/// Flux-dev transformer carrying the PuLID cross-attention stack under `pulid_ca.*`.
#[derive(Debug, Clone)]
pub struct PulidFlux {
    img_in: Linear,
    txt_in: Linear,
    time_in: MlpEmbedder,
    vector_in: MlpEmbedder,
    guidance_in: Option<MlpEmbedder>,
    pe_embedder: EmbedNd,
    double_blocks: Vec<DoubleStreamBlock>,
    single_blocks: Vec<SingleStreamBlock>,
    pulid_ca: Vec<PerceiverAttentionCa>,
    final_layer: LastLayer,
}

/// Number of identity cross-attention modules for the given block counts.
pub fn num_id_cross_attn(cfg: &Config) -> usize {
    cfg.depth.div_ceil(DOUBLE_INTERVAL) + cfg.depth_single_blocks.div_ceil(SINGLE_INTERVAL)
}

impl PulidFlux {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let h_sz = cfg.hidden_size;
        let img_in = candle_nn::linear(cfg.in_channels, h_sz, vb.pp("img_in"))?;
        let txt_in = candle_nn::linear(cfg.context_in_dim, h_sz, vb.pp("txt_in"))?;
        let vb_d = vb.pp("double_blocks");
        let double_blocks = (0..cfg.depth)
            .map(|idx| DoubleStreamBlock::new(cfg, vb_d.pp(idx)))
            .collect::<Result<Vec<_>>>()?;
        let vb_s = vb.pp("single_blocks");
        let single_blocks = (0..cfg.depth_single_blocks)
            .map(|idx| SingleStreamBlock::new(cfg, vb_s.pp(idx)))
            .collect::<Result<Vec<_>>>()?;
        let vb_ca = vb.pp("pulid_ca");
        let pulid_ca = (0..num_id_cross_attn(cfg))
            .map(|idx| PerceiverAttentionCa::new(h_sz, ID_DIM, 128, 16, vb_ca.pp(idx)))
            .collect::<Result<Vec<_>>>()?;
        let time_in = MlpEmbedder::new(256, h_sz, vb.pp("time_in"))?;
        let vector_in = MlpEmbedder::new(cfg.vec_in_dim, h_sz, vb.pp("vector_in"))?;
        let guidance_in = if cfg.guidance_embed {
            Some(MlpEmbedder::new(256, h_sz, vb.pp("guidance_in"))?)
        } else {
            None
        };
        let final_layer = LastLayer::new(h_sz, 1, cfg.in_channels, vb.pp("final_layer"))?;
        let pe_embedder = EmbedNd {
            theta: cfg.theta,
            axes_dim: cfg.axes_dim.to_vec(),
        };
        Ok(Self {
            img_in,
            txt_in,
            time_in,
            vector_in,
            guidance_in,
            pe_embedder,
            double_blocks,
            single_blocks,
            pulid_ca,
            final_layer,
        })
    }

    /// `id` is the identity token sequence and its weight; `None` skips every cross-attention.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        img: &Tensor,
        img_ids: &Tensor,
        txt: &Tensor,
        txt_ids: &Tensor,
        timesteps: &Tensor,
        y: &Tensor,
        guidance: Option<&Tensor>,
        id: Option<(&Tensor, f64)>,
    ) -> Result<Tensor> {
        if txt.rank() != 3 {
            candle_core::bail!("unexpected shape for txt {:?}", txt.shape())
        }
        if img.rank() != 3 {
            candle_core::bail!("unexpected shape for img {:?}", img.shape())
        }
        let dtype = img.dtype();
        let pe = {
            let ids = Tensor::cat(&[txt_ids, img_ids], 1)?;
            ids.apply(&self.pe_embedder)?
        };
        let mut txt = txt.apply(&self.txt_in)?;
        let mut img = img.apply(&self.img_in)?;
        let vec_ = timestep_embedding(timesteps, 256, dtype)?.apply(&self.time_in)?;
        let vec_ = match (self.guidance_in.as_ref(), guidance) {
            (Some(g_in), Some(guidance)) => {
                (vec_ + timestep_embedding(guidance, 256, dtype)?.apply(g_in))?
            }
            _ => vec_,
        };
        let vec_ = (vec_ + y.apply(&self.vector_in))?;

        let mut id_layers = self.pulid_ca.iter();
        let mut inject = |stream: Tensor| -> Result<Tensor> {
            match (id, id_layers.next()) {
                (Some((id, weight)), Some(ca)) => &stream + (ca.forward(id, &stream)? * weight)?,
                (Some(_), None) => candle_core::bail!("ran out of identity cross-attention modules"),
                (None, _) => Ok(stream),
            }
        };

        for (i, block) in self.double_blocks.iter().enumerate() {
            (img, txt) = block.forward(&img, &txt, &vec_, &pe)?;
            if id.is_some() && i % DOUBLE_INTERVAL == 0 {
                img = inject(img)?;
            }
        }

        let txt_len = txt.dim(1)?;
        let mut img = Tensor::cat(&[&txt, &img], 1)?;
        for (i, block) in self.single_blocks.iter().enumerate() {
            img = block.forward(&img, &vec_, &pe)?;
            if id.is_some() && i % SINGLE_INTERVAL == 0 {
                let txt = img.narrow(1, 0, txt_len)?;
                let real_img = img.narrow(1, txt_len, img.dim(1)? - txt_len)?;
                let real_img = inject(real_img)?;
                img = Tensor::cat(&[&txt, &real_img], 1)?;
            }
        }
        let img = img.i((.., txt_len..))?;
        self.final_layer.forward(&img, &vec_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn tiny() -> Config {
        Config {
            in_channels: 4,
            vec_in_dim: 6,
            context_in_dim: 5,
            hidden_size: 64,
            mlp_ratio: 1.0,
            num_heads: 4,
            depth: 3,
            depth_single_blocks: 5,
            axes_dim: vec![4, 6, 6],
            theta: 10_000,
            qkv_bias: true,
            guidance_embed: true,
        }
    }

    #[test]
    fn cross_attention_count() {
        assert_eq!(num_id_cross_attn(&Config::dev()), 20);
        assert_eq!(num_id_cross_attn(&tiny()), 2 + 2);
    }

    #[test]
    fn perceiver_keeps_latent_shape() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let ca = PerceiverAttentionCa::new(64, 32, 8, 4, vb)?;
        let id = Tensor::randn(0f32, 1., (1, 32, 32), &dev)?;
        let latents = Tensor::randn(0f32, 1., (1, 10, 64), &dev)?;
        let out = ca.forward(&id, &latents)?;
        assert_eq!(out.dims(), &[1, 10, 64]);
        Ok(())
    }

    fn diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
        Ok((a - b)?.abs()?.sum_all()?.to_scalar::<f32>()?)
    }

    #[test]
    fn identity_weight_gates_injection() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let cfg = tiny();
        let varmap = VarMap::new();
        let model = PulidFlux::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;

        let img = Tensor::randn(0f32, 1., (1, 8, cfg.in_channels), &dev)?;
        let img_ids = Tensor::zeros((1, 8, 3), DType::F32, &dev)?;
        let txt = Tensor::randn(0f32, 1., (1, 3, cfg.context_in_dim), &dev)?;
        let txt_ids = Tensor::zeros((1, 3, 3), DType::F32, &dev)?;
        let y = Tensor::randn(0f32, 1., (1, cfg.vec_in_dim), &dev)?;
        let t = Tensor::full(0.5f32, 1, &dev)?;
        let guidance = Tensor::full(4f32, 1, &dev)?;
        let id = Tensor::randn(0f32, 1., (1, 5, ID_DIM), &dev)?;

        let run = |id: Option<(&Tensor, f64)>| {
            model.forward(&img, &img_ids, &txt, &txt_ids, &t, &y, Some(&guidance), id)
        };
        let plain = run(None)?;
        let zero = run(Some((&id, 0.0)))?;
        let full = run(Some((&id, 1.0)))?;

        assert_eq!(plain.dims(), &[1, 8, cfg.in_channels]);
        assert_eq!(diff(&plain, &zero)?, 0.0);
        assert!(diff(&plain, &full)? > 1e-3);
        Ok(())
    }
}
