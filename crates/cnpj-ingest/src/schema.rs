//! CNPJ file kinds and their target tables
//!
//! Each monthly release ships ten kinds of archive. Every kind maps to one
//! table with a fixed column order (the CSV files carry no header), a natural
//! key used for upserts, and columns needing value conversion.

use serde::Serialize;

/// Closed set of archive kinds in a release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Cnaes,
    Motivos,
    Municipios,
    NaturezasJuridicas,
    Paises,
    Qualificacoes,
    Empresas,
    Estabelecimentos,
    Socios,
    Simples,
}

/// Static description of one target table
#[derive(Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub kind: FileKind,
    pub table: &'static str,
    pub columns: &'static [&'static str],
    /// Upsert identity; never NULL in stored rows
    pub natural_key: &'static [&'static str],
    /// Decimal-comma values parsed to floating point
    pub numeric: &'static [&'static str],
    /// `YYYYMMDD` text where `0` means "no date"
    pub dates: &'static [&'static str],
}

impl TableSchema {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| *c == name)
    }

    pub fn is_numeric(&self, idx: usize) -> bool {
        self.numeric.contains(&self.columns[idx])
    }

    pub fn key_indices(&self) -> Vec<usize> {
        self.natural_key
            .iter()
            .filter_map(|k| self.column_index(k))
            .collect()
    }
}

const REFERENCE_COLUMNS: &[&str] = &["codigo", "descricao"];
const REFERENCE_KEY: &[&str] = &["codigo"];

const fn reference(kind: FileKind, table: &'static str) -> TableSchema {
    TableSchema {
        kind,
        table,
        columns: REFERENCE_COLUMNS,
        natural_key: REFERENCE_KEY,
        numeric: &[],
        dates: &[],
    }
}

static CNAES: TableSchema = reference(FileKind::Cnaes, "cnaes");
static MOTIVOS: TableSchema = reference(FileKind::Motivos, "motivos");
static MUNICIPIOS: TableSchema = reference(FileKind::Municipios, "municipios");
static NATUREZAS: TableSchema = reference(FileKind::NaturezasJuridicas, "naturezas_juridicas");
static PAISES: TableSchema = reference(FileKind::Paises, "paises");
static QUALIFICACOES: TableSchema = reference(FileKind::Qualificacoes, "qualificacoes_socios");

static EMPRESAS: TableSchema = TableSchema {
    kind: FileKind::Empresas,
    table: "empresas",
    columns: &[
        "cnpj_basico",
        "razao_social",
        "natureza_juridica",
        "qualificacao_responsavel",
        "capital_social",
        "porte",
        "ente_federativo_responsavel",
    ],
    natural_key: &["cnpj_basico"],
    numeric: &["capital_social"],
    dates: &[],
};

static ESTABELECIMENTOS: TableSchema = TableSchema {
    kind: FileKind::Estabelecimentos,
    table: "estabelecimentos",
    columns: &[
        "cnpj_basico",
        "cnpj_ordem",
        "cnpj_dv",
        "identificador_matriz_filial",
        "nome_fantasia",
        "situacao_cadastral",
        "data_situacao_cadastral",
        "motivo_situacao_cadastral",
        "nome_cidade_exterior",
        "pais",
        "data_inicio_atividade",
        "cnae_fiscal_principal",
        "cnae_fiscal_secundaria",
        "tipo_logradouro",
        "logradouro",
        "numero",
        "complemento",
        "bairro",
        "cep",
        "uf",
        "municipio",
        "ddd_1",
        "telefone_1",
        "ddd_2",
        "telefone_2",
        "ddd_fax",
        "fax",
        "correio_eletronico",
        "situacao_especial",
        "data_situacao_especial",
    ],
    natural_key: &["cnpj_basico", "cnpj_ordem", "cnpj_dv"],
    numeric: &[],
    dates: &[
        "data_situacao_cadastral",
        "data_inicio_atividade",
        "data_situacao_especial",
    ],
};

static SOCIOS: TableSchema = TableSchema {
    kind: FileKind::Socios,
    table: "socios",
    columns: &[
        "cnpj_basico",
        "identificador_de_socio",
        "nome_socio",
        "cnpj_cpf_do_socio",
        "qualificacao_do_socio",
        "data_entrada_sociedade",
        "pais",
        "representante_legal",
        "nome_do_representante",
        "qualificacao_do_representante_legal",
        "faixa_etaria",
    ],
    natural_key: &[
        "cnpj_basico",
        "identificador_de_socio",
        "cnpj_cpf_do_socio",
        "nome_socio",
    ],
    numeric: &[],
    dates: &["data_entrada_sociedade"],
};

static SIMPLES: TableSchema = TableSchema {
    kind: FileKind::Simples,
    table: "dados_simples",
    columns: &[
        "cnpj_basico",
        "opcao_pelo_simples",
        "data_opcao_pelo_simples",
        "data_exclusao_do_simples",
        "opcao_pelo_mei",
        "data_opcao_pelo_mei",
        "data_exclusao_do_mei",
    ],
    natural_key: &["cnpj_basico"],
    numeric: &[],
    dates: &[
        "data_opcao_pelo_simples",
        "data_exclusao_do_simples",
        "data_opcao_pelo_mei",
        "data_exclusao_do_mei",
    ],
};

impl FileKind {
    pub const ALL: [FileKind; 10] = [
        FileKind::Cnaes,
        FileKind::Motivos,
        FileKind::Municipios,
        FileKind::NaturezasJuridicas,
        FileKind::Paises,
        FileKind::Qualificacoes,
        FileKind::Empresas,
        FileKind::Estabelecimentos,
        FileKind::Socios,
        FileKind::Simples,
    ];

    pub fn schema(self) -> &'static TableSchema {
        match self {
            FileKind::Cnaes => &CNAES,
            FileKind::Motivos => &MOTIVOS,
            FileKind::Municipios => &MUNICIPIOS,
            FileKind::NaturezasJuridicas => &NATUREZAS,
            FileKind::Paises => &PAISES,
            FileKind::Qualificacoes => &QUALIFICACOES,
            FileKind::Empresas => &EMPRESAS,
            FileKind::Estabelecimentos => &ESTABELECIMENTOS,
            FileKind::Socios => &SOCIOS,
            FileKind::Simples => &SIMPLES,
        }
    }

    /// Marker embedded in the inner CSV name, e.g. `K3241.K03200Y0.D40511.EMPRECSV`
    fn csv_marker(self) -> &'static str {
        match self {
            FileKind::Cnaes => "CNAECSV",
            FileKind::Motivos => "MOTICSV",
            FileKind::Municipios => "MUNICCSV",
            FileKind::NaturezasJuridicas => "NATJUCSV",
            FileKind::Paises => "PAISCSV",
            FileKind::Qualificacoes => "QUALSCSV",
            FileKind::Empresas => "EMPRECSV",
            FileKind::Estabelecimentos => "ESTABELE",
            FileKind::Socios => "SOCIOCSV",
            FileKind::Simples => "SIMPLES",
        }
    }

    /// Archive name prefix, e.g. `Empresas3.zip`
    fn archive_prefix(self) -> &'static str {
        match self {
            FileKind::Cnaes => "CNAES",
            FileKind::Motivos => "MOTIVOS",
            FileKind::Municipios => "MUNICIPIOS",
            FileKind::NaturezasJuridicas => "NATUREZAS",
            FileKind::Paises => "PAISES",
            FileKind::Qualificacoes => "QUALIFICACOES",
            FileKind::Empresas => "EMPRESAS",
            FileKind::Estabelecimentos => "ESTABELECIMENTOS",
            FileKind::Socios => "SOCIOS",
            FileKind::Simples => "SIMPLES",
        }
    }

    /// Detect from the inner entry name first, then from the archive name
    pub fn detect(entry_name: Option<&str>, archive_name: &str) -> Option<FileKind> {
        if let Some(entry) = entry_name {
            let upper = entry.to_ascii_uppercase();
            if let Some(kind) = Self::ALL.into_iter().find(|k| upper.contains(k.csv_marker())) {
                return Some(kind);
            }
        }

        let base = archive_name
            .rsplit('/')
            .next()
            .unwrap_or(archive_name)
            .to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|k| base.starts_with(k.archive_prefix()))
    }
}
